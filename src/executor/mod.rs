// Privileged executor abstraction
//
// The orchestrator only relies on this contract: hand over a command line,
// get back two line streams and a single exit code.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::error::FlashError;

mod shell;
pub use shell::PrivilegedExecutor;

/// A program plus its arguments, kept unquoted until it reaches a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments after the program, without the program itself
    pub fn tail(&self) -> String {
        self.args.join(" ")
    }

    /// Render as a single string safe to pass to `sh -c`
    pub fn to_shell_string(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|part| shell_quote(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn shell_quote(part: &str) -> String {
    let safe = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c));
    if safe {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

/// Live handle to a running command.
///
/// Both line channels close once the process output is fully drained; the
/// exit code is delivered after that.
#[derive(Debug)]
pub struct Execution {
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

/// Runs command lines with elevated privilege
pub trait Executor: Send + Sync {
    fn execute(&self, command: &CommandLine) -> Result<Execution, FlashError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Canned response for one invocation
    #[derive(Debug, Clone, Default)]
    pub struct Script {
        pub stdout: Vec<String>,
        pub stderr: Vec<String>,
        pub exit_code: i32,
        pub fail_to_start: bool,
    }

    impl Script {
        pub fn exit(code: i32) -> Self {
            Self {
                exit_code: code,
                ..Default::default()
            }
        }

        pub fn with_stdout(mut self, lines: &[&str]) -> Self {
            self.stdout = lines.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn with_stderr(mut self, lines: &[&str]) -> Self {
            self.stderr = lines.iter().map(|s| s.to_string()).collect();
            self
        }
    }

    /// Executor replaying scripts in order and recording every command
    #[derive(Default)]
    pub struct ScriptedExecutor {
        scripts: Mutex<VecDeque<Script>>,
        invocations: Mutex<Vec<CommandLine>>,
        last_arg_contents: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl ScriptedExecutor {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                invocations: Mutex::new(Vec::new()),
                last_arg_contents: Mutex::new(Vec::new()),
            }
        }

        pub fn invocations(&self) -> Vec<CommandLine> {
            self.invocations.lock().unwrap().clone()
        }

        /// Bytes of the file named by each invocation's last argument, read
        /// while the command was "running" (staged copies vanish afterwards)
        pub fn last_arg_contents(&self) -> Vec<Option<Vec<u8>>> {
            self.last_arg_contents.lock().unwrap().clone()
        }
    }

    impl Executor for ScriptedExecutor {
        fn execute(&self, command: &CommandLine) -> Result<Execution, FlashError> {
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            if script.fail_to_start {
                return Err(FlashError::ExecutorIo(format!(
                    "cannot start {}",
                    command.program.display()
                )));
            }
            self.invocations.lock().unwrap().push(command.clone());
            let contents = command.args.last().and_then(|arg| std::fs::read(arg).ok());
            self.last_arg_contents.lock().unwrap().push(contents);

            let (out_tx, stdout) = mpsc::unbounded_channel();
            let (err_tx, stderr) = mpsc::unbounded_channel();
            let (exit_tx, exit) = oneshot::channel();
            for line in script.stdout {
                let _ = out_tx.send(line);
            }
            for line in script.stderr {
                let _ = err_tx.send(line);
            }
            let _ = exit_tx.send(script.exit_code);

            Ok(Execution {
                stdout,
                stderr,
                exit,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_string_quotes_only_when_needed() {
        let cmd = CommandLine::new("/data/adb/ksud")
            .args(["module", "install"])
            .arg("/sdcard/Download/my module's.zip");
        assert_eq!(
            cmd.to_shell_string(),
            r"/data/adb/ksud module install '/sdcard/Download/my module'\''s.zip'"
        );
        assert_eq!(cmd.tail(), "module install /sdcard/Download/my module's.zip");
    }

    #[test]
    fn display_is_unquoted() {
        let cmd = CommandLine::new("ksud").args(["boot-restore", "-f"]);
        assert_eq!(cmd.to_string(), "ksud boot-restore -f");
    }
}
