//! Exit codes of the bootstrap-management scripts and what they mean.

/// Exit code the scripts use for a failure that carries its own message.
pub const CUSTOM_ERROR: u32 = 255;

const UNEXPECTED: ScriptError = ScriptError {
    code: 500,
    message: "Script terminated unexpectedly",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptError {
    pub code: u32,
    pub message: &'static str,
}

static CATALOGUE: &[ScriptError] = &[
    ScriptError { code: 100, message: "Cloudify environment file not found! Bootstrapping cannot proceed!" },
    ScriptError { code: 101, message: "Failed downloading Java installation" },
    ScriptError { code: 102, message: "Failed removing old java installation directory" },
    ScriptError { code: 103, message: "Failed moving JDK installation" },
    ScriptError { code: 104, message: "Failed downloading cloudify installation" },
    ScriptError { code: 105, message: "Failed downloading cloudify overrides" },
    ScriptError { code: 106, message: "Failed removing old gigaspaces directory" },
    ScriptError { code: 107, message: "Failed creating gigaspaces directory" },
    ScriptError { code: 108, message: "Failed extracting cloudify installation" },
    ScriptError { code: 109, message: "Failed changing permissions in cloudify installation" },
    ScriptError { code: 110, message: "Failed moving cloudify installation" },
    ScriptError { code: 111, message: "Failed extracting cloudify overrides" },
    ScriptError { code: 112, message: "Failed changing directory to bin directory" },
    ScriptError { code: 113, message: "Failed updating setenv.sh" },
    ScriptError { code: 114, message: "Failed to remove nohup.out, it might be used by another process" },
    ScriptError { code: 115, message: "Current user is not a sudoer, or requires a password for sudo" },
    ScriptError { code: 116, message: "Could not find sudoers file at expected location (/etc/sudoers)" },
    ScriptError { code: 117, message: "Failed to edit sudoers file to disable requiretty directive" },
    ScriptError { code: 118, message: "Failed changing directory to cli directory" },
    ScriptError { code: 119, message: "Host name and address validation aborted, host could not be resolved." },
    ScriptError { code: 120, message: "Host validation aborted, a security manager exists and permission to perform the operation is denied." },
    ScriptError { code: 121, message: "NIC validation aborted, host could not be resolved." },
    ScriptError { code: 122, message: "NIC validation aborted, I/O error occurred when creating the socket or connecting." },
    ScriptError { code: 123, message: "NIC validation aborted, a security manager exists and permission to perform the operation is denied." },
    ScriptError { code: 124, message: "Port validation aborted, host could not be resolved." },
    ScriptError { code: 125, message: "Port validation aborted, I/O error occurred when creating the socket or connecting." },
    ScriptError { code: 126, message: "Port validation aborted, a security manager exists and permission to perform the operation is denied." },
    ScriptError { code: 127, message: "The lookup service connection validation was aborted, host could not be resolved." },
    ScriptError { code: 128, message: "The lookup service connection validation was aborted, I/O error occurred when creating the socket or connecting." },
    ScriptError { code: 129, message: "The lookup service connection validation aborted, a security manager exists and permission to perform the operation is denied." },
    ScriptError { code: 130, message: "Cloudify validation failed." },
    ScriptError { code: 131, message: "Failed to find a running agent after bootstrap completed." },
    ScriptError { code: 132, message: "Some management components (LUS/ESM/GSM) are not available after bootstrap completed. Please review the logs for more details." },
    ScriptError { code: 133, message: "Failed to find a required management service (space, web-UI or Rest) after bootstrap completed. Please review the logs for more details." },
    ScriptError { code: 134, message: "Failed deleting gigaspaces.tar.gz from home directory" },
    ScriptError { code: 135, message: "Failed deleting gigaspaces_overrides.tar.gz from home directory" },
    ScriptError { code: 136, message: "Failed deleting java.bin from home directory" },
    ScriptError { code: CUSTOM_ERROR, message: "" },
];

/// Look up a script exit code. Unknown codes map to code 500.
pub fn lookup(exit_code: u32) -> ScriptError {
    CATALOGUE
        .iter()
        .find(|e| e.code == exit_code)
        .copied()
        .unwrap_or(UNEXPECTED)
}

/// The error message for a failed bootstrap run. A custom error (255) uses
/// the script's own output as the message.
pub fn message_for_exit_code(exit_code: u32, output: &str) -> String {
    let error = lookup(exit_code);
    if error.code == CUSTOM_ERROR {
        let output = output.trim();
        if output.is_empty() {
            return format!("Bootstrap script exited with custom error code {CUSTOM_ERROR}");
        }
        return output.to_string();
    }
    format!("{} (exit code {exit_code})", error.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes() {
        assert_eq!(lookup(100).message, "Cloudify environment file not found! Bootstrapping cannot proceed!");
        assert_eq!(lookup(130).message, "Cloudify validation failed.");
        assert_eq!(
            lookup(126).message,
            "Port validation aborted, a security manager exists and permission to perform the operation is denied."
        );
    }

    #[test]
    fn unknown_codes_are_unexpected() {
        assert_eq!(lookup(1), ScriptError { code: 500, message: "Script terminated unexpectedly" });
        assert_eq!(lookup(137).code, 500);
    }

    #[test]
    fn messages() {
        assert_eq!(
            message_for_exit_code(115, ""),
            "Current user is not a sudoer, or requires a password for sudo (exit code 115)"
        );
        assert_eq!(message_for_exit_code(255, "  JAVA_HOME not set\n"), "JAVA_HOME not set");
        assert_eq!(
            message_for_exit_code(255, ""),
            "Bootstrap script exited with custom error code 255"
        );
        assert_eq!(message_for_exit_code(2, "x"), "Script terminated unexpectedly (exit code 2)");
    }
}
