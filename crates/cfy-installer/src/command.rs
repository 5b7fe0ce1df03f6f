//! Builders for the remote bootstrap command line and the environment file
//! uploaded next to the bootstrap script.

use std::fmt;

use cfy_infra::types::{RemoteExecutionMode, ScriptLanguage};
use tracing::trace;

const SEPARATOR: &str = ";";

/// Translate a CIFS administrative-share path (`/c$/gs/files`) to a Windows
/// path (`c:\gs\files`). Anything else is returned unchanged.
pub fn normalize_cifs_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let is_share_path = bytes.len() >= 4
        && bytes[0] == b'/'
        && bytes[1].is_ascii_alphabetic()
        && bytes[2] == b'$'
        && bytes[3] == b'/'
        && !path.contains('\n');
    if !is_share_path {
        return path.to_string();
    }
    format!("{}:\\{}", bytes[1] as char, path[4..].replace('/', "\\"))
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote `value` as a PowerShell literal string.
pub fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `value` as it should appear on the right of a POSIX `NAME=`: unchanged
/// when empty, already double-quoted or made only of shell-safe
/// characters, single-quoted otherwise.
fn shell_value(value: &str) -> String {
    let already_quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./:,@%+=".contains(c));
    if already_quoted || safe {
        value.to_string()
    } else {
        shell_quote(value)
    }
}

/// Accumulates a one-line remote command: variable exports, a `chmod`, and
/// the call itself, separated by `;`.
///
/// ```
/// use cfy_infra::types::RemoteExecutionMode;
/// use cfy_installer::command::ShellCommandBuilder;
///
/// let mut cmd = ShellCommandBuilder::new(RemoteExecutionMode::Ssh);
/// cmd.export_var("GSA_MODE", "agent")
///     .chmod_executable("/tmp/gs-files/run.sh")
///     .call("/tmp/gs-files/run.sh");
/// assert_eq!(
///     cmd.to_string(),
///     "export GSA_MODE=agent;chmod +x /tmp/gs-files/run.sh;/tmp/gs-files/run.sh"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ShellCommandBuilder {
    mode: RemoteExecutionMode,
    command: String,
}

impl ShellCommandBuilder {
    pub fn new(mode: RemoteExecutionMode) -> Self {
        Self {
            mode,
            command: String::new(),
        }
    }

    /// `export NAME=value` (SSH) or `$ENV:NAME='value'` (WinRM). SSH values
    /// with shell metacharacters are single-quoted unless the caller
    /// already double-quoted them.
    pub fn export_var(&mut self, name: &str, value: &str) -> &mut Self {
        trace!(name, "exporting var");
        match self.mode {
            RemoteExecutionMode::Ssh => {
                self.command
                    .push_str(&format!("export {name}={}", shell_value(value)));
            }
            RemoteExecutionMode::Winrm => {
                let normalized = normalize_cifs_path(value);
                let quoted = if normalized.len() >= 2
                    && normalized.starts_with('"')
                    && normalized.ends_with('"')
                {
                    normalized.replace('"', "'")
                } else {
                    format!("'{normalized}'")
                };
                self.command.push_str(&format!("$ENV:{name}={quoted}"));
            }
        }
        self.separate()
    }

    /// Mark `path` executable. A no-op on Windows.
    pub fn chmod_executable(&mut self, path: &str) -> &mut Self {
        if self.mode == RemoteExecutionMode::Ssh {
            self.command.push_str(&format!("chmod +x {path}"));
            self.separate();
        }
        self
    }

    pub fn call(&mut self, command: &str) -> &mut Self {
        match self.mode {
            RemoteExecutionMode::Ssh => self.command.push_str(command),
            RemoteExecutionMode::Winrm => self.command.push_str(&normalize_cifs_path(command)),
        }
        self
    }

    pub fn separate(&mut self) -> &mut Self {
        self.command.push_str(SEPARATOR);
        self
    }
}

impl fmt::Display for ShellCommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

/// Builds the `cloudify_env` script the bootstrap script sources.
#[derive(Debug, Clone)]
pub struct EnvironmentFileBuilder {
    language: ScriptLanguage,
    contents: String,
}

impl EnvironmentFileBuilder {
    pub fn new(language: ScriptLanguage) -> Self {
        Self {
            language,
            contents: String::new(),
        }
    }

    pub fn export_var(&mut self, name: &str, value: &str) -> &mut Self {
        match self.language {
            ScriptLanguage::LinuxShell => {
                self.contents
                    .push_str(&format!("export {name}={}", shell_value(value)));
            }
            ScriptLanguage::WindowsBatch => {
                let unquoted = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                    &value[1..value.len() - 1]
                } else {
                    value
                };
                self.contents
                    .push_str(&format!("SET {name}={}", normalize_cifs_path(unquoted)));
            }
        }
        self.contents.push_str(self.language.newline());
        self
    }

    /// Like [`Self::export_var`], double-quoting the value on Linux.
    pub fn export_var_with_quotes(&mut self, name: &str, value: &str) -> &mut Self {
        match self.language {
            ScriptLanguage::LinuxShell => self.export_var(name, &format!("\"{value}\"")),
            ScriptLanguage::WindowsBatch => self.export_var(name, value),
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self.language {
            ScriptLanguage::LinuxShell => "cloudify_env.sh",
            ScriptLanguage::WindowsBatch => "cloudify_env.bat",
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cifs_paths() {
        assert_eq!(normalize_cifs_path("/c$/gs/files"), "c:\\gs\\files");
        assert_eq!(normalize_cifs_path("/D$/x"), "D:\\x");
        assert_eq!(normalize_cifs_path("/tmp/gs-files"), "/tmp/gs-files");
        assert_eq!(normalize_cifs_path("c$/x"), "c$/x");
    }

    #[test]
    fn winrm_exports_quote_and_normalize() {
        let mut cmd = ShellCommandBuilder::new(RemoteExecutionMode::Winrm);
        cmd.export_var("WORKING_HOME_DIRECTORY", "/c$/gs")
            .export_var("GIGASPACES_LINK", "\"http://repo/gs.zip\"")
            .chmod_executable("/c$/gs/bootstrap-management.bat")
            .call("/c$/gs/bootstrap-management.bat");
        assert_eq!(
            cmd.to_string(),
            "$ENV:WORKING_HOME_DIRECTORY='c:\\gs';$ENV:GIGASPACES_LINK='http://repo/gs.zip';c:\\gs\\bootstrap-management.bat"
        );
    }

    #[test]
    fn ssh_exports_quote_shell_metacharacters() {
        let mut cmd = ShellCommandBuilder::new(RemoteExecutionMode::Ssh);
        cmd.export_var("PASSWORD", "p@ss word;rm -rf /")
            .export_var("EXTRA", "$(id)")
            .export_var("QUOTE", "it's")
            .export_var("LINK", "\"http://repo/gs.tar.gz\"")
            .export_var("EMPTY", "")
            .export_var("ZONES", "web,db");
        assert_eq!(
            cmd.to_string(),
            "export PASSWORD='p@ss word;rm -rf /';export EXTRA='$(id)';export QUOTE='it'\\''s';\
             export LINK=\"http://repo/gs.tar.gz\";export EMPTY=;export ZONES=web,db;"
        );

        let mut env = EnvironmentFileBuilder::new(ScriptLanguage::LinuxShell);
        env.export_var("PASSWORD", "a b");
        assert_eq!(env.contents(), "export PASSWORD='a b'\n");
    }

    #[test]
    fn environment_files() {
        let mut linux = EnvironmentFileBuilder::new(ScriptLanguage::LinuxShell);
        linux
            .export_var("GSA_MODE", "lus")
            .export_var_with_quotes("GIGASPACES_LINK", "http://repo/gs.tar.gz");
        assert_eq!(linux.file_name(), "cloudify_env.sh");
        assert_eq!(
            linux.contents(),
            "export GSA_MODE=lus\nexport GIGASPACES_LINK=\"http://repo/gs.tar.gz\"\n"
        );

        let mut windows = EnvironmentFileBuilder::new(ScriptLanguage::WindowsBatch);
        windows
            .export_var_with_quotes("WORKING_HOME_DIRECTORY", "/c$/gs")
            .export_var("LINK", "\"http://repo\"");
        assert_eq!(windows.file_name(), "cloudify_env.bat");
        assert_eq!(
            windows.contents(),
            "SET WORKING_HOME_DIRECTORY=c:\\gs\r\nSET LINK=http://repo\r\n"
        );
    }

    #[test]
    fn shell_quoting() {
        assert_eq!(shell_quote("/tmp/gs files"), "'/tmp/gs files'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(powershell_quote("C:\\it's"), "'C:\\it''s'");
    }
}
