//! The bottom of the runner stack: executes commands as subprocesses.
//!
//! Each command runs on its own thread, which blocks on the child and sends
//! the outcome over a channel; run_commands drains that channel on the
//! scheduler thread.  Commands run under `/bin/sh -c` via posix_spawn, with
//! stdout and stderr merged into one pipe.  (Rust's std::process cannot
//! merge the two streams into a single pipe, and posix_spawn is cheaper
//! than fork on the platforms this targets.)
//!
//! A platform file tracer would report which files each command touched; on
//! this portable backend the observed sets come back empty and the
//! scheduler falls back to the declared sets.

use crate::runner::{CommandResult, CommandRunner, OnDone, Termination};
use crate::signal;
use hashbrown::HashMap;
use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::sync::mpsc;
use std::time::Duration;

struct Finished {
    token: u64,
    termination: Termination,
    output: Vec<u8>,
}

pub struct SubprocessRunner {
    finished_send: mpsc::Sender<Finished>,
    finished_recv: mpsc::Receiver<Finished>,
    callbacks: HashMap<u64, OnDone>,
    next_token: u64,
}

impl SubprocessRunner {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        SubprocessRunner {
            finished_send: tx,
            finished_recv: rx,
            callbacks: HashMap::new(),
            next_token: 0,
        }
    }

    fn deliver(&mut self, fin: Finished) {
        let on_done = self
            .callbacks
            .remove(&fin.token)
            .expect("completion for unknown command");
        on_done(CommandResult::untraced(fin.termination, fin.output));
    }
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SubprocessRunner {
    fn invoke(&mut self, command: &str, pool: &str, on_done: OnDone) {
        let token = self.next_token;
        self.next_token += 1;
        self.callbacks.insert(token, on_done);

        let tx = self.finished_send.clone();
        let command = command.to_owned();
        // The console pool owns the terminal: its command inherits our
        // stdio instead of writing into a capture pipe.
        let use_console = pool == "console";
        std::thread::spawn(move || {
            let (termination, output) = match run_command(&command, use_console) {
                Ok(done) => done,
                Err(err) => (Termination::Failure, err.to_string().into_bytes()),
            };
            // Send fails only if the runner was dropped mid-shutdown.
            let _ = tx.send(Finished {
                token,
                termination,
                output,
            });
        });
    }

    fn size(&self) -> usize {
        self.callbacks.len()
    }

    fn can_run_more(&self) -> bool {
        // Admission is the limiter layer's business.
        true
    }

    fn run_commands(&mut self) -> bool {
        if self.callbacks.is_empty() {
            return signal::was_interrupted();
        }
        let first = loop {
            match self.finished_recv.recv_timeout(Duration::from_millis(100)) {
                Ok(fin) => break fin,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if signal::was_interrupted() {
                        return true;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    unreachable!("runner holds its own sender")
                }
            }
        };
        self.deliver(first);
        while let Ok(fin) = self.finished_recv.try_recv() {
            self.deliver(fin);
        }
        signal::was_interrupted()
    }
}

fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret != 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        anyhow::bail!("{}: {}", func, err_str.to_string_lossy());
    }
    Ok(())
}

struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

extern "C" {
    static environ: *const *mut libc::c_char;
}

/// Run a command to completion.  Returns Err only for failures on our side
/// of the spawn; the child failing is a normal Termination::Failure.
fn run_command(command: &str, use_console: bool) -> anyhow::Result<(Termination, Vec<u8>)> {
    let sh = b"/bin/sh\0".as_ptr() as *const libc::c_char;
    let dash_c = b"-c\0".as_ptr() as *const libc::c_char;
    let cmd = std::ffi::CString::new(command)?;
    let argv = [sh, dash_c, cmd.as_ptr(), std::ptr::null()];

    let mut output = Vec::new();
    let pid = if use_console {
        // Inherit our stdio; nothing to capture.
        let mut pid: libc::pid_t = 0;
        let mut actions = PosixSpawnFileActions::new()?;
        check_posix("posix_spawn", unsafe {
            libc::posix_spawn(
                &mut pid,
                sh,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                environ,
            )
        })?;
        pid
    } else {
        let (pid, mut pipe) = unsafe {
            use std::os::fd::FromRawFd;

            let mut fds: [libc::c_int; 2] = [0; 2];
            if libc::pipe(fds.as_mut_ptr()) != 0 {
                anyhow::bail!("pipe: {}", std::io::Error::last_os_error());
            }

            let mut actions = PosixSpawnFileActions::new()?;
            // stdout and stderr both land in the pipe; the child never sees
            // the pipe fds themselves.
            actions.adddup2(fds[1], 1)?;
            actions.adddup2(fds[1], 2)?;
            actions.addclose(fds[0])?;
            actions.addclose(fds[1])?;

            let mut pid: libc::pid_t = 0;
            check_posix(
                "posix_spawn",
                libc::posix_spawn(
                    &mut pid,
                    sh,
                    actions.as_ptr(),
                    std::ptr::null(),
                    argv.as_ptr() as *const *mut libc::c_char,
                    environ,
                ),
            )?;

            libc::close(fds[1]);
            (pid, std::fs::File::from_raw_fd(fds[0]))
        };
        pipe.read_to_end(&mut output)?;
        pid
    };

    let status = unsafe {
        let mut status: libc::c_int = 0;
        if libc::waitpid(pid, &mut status, 0) < 0 {
            anyhow::bail!("waitpid: {}", std::io::Error::last_os_error());
        }
        std::process::ExitStatus::from_raw(status)
    };

    let termination = if status.success() {
        Termination::Success
    } else if status.signal() == Some(libc::SIGINT) {
        let _ = write!(output, "interrupted");
        Termination::Interrupted
    } else {
        if let Some(sig) = status.signal() {
            let _ = write!(output, "signal {}", sig);
        }
        Termination::Failure
    };
    Ok((termination, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run_to_completion(runner: &mut SubprocessRunner) {
        while !runner.empty() {
            runner.run_commands();
        }
    }

    #[test]
    fn captures_merged_output() {
        let mut runner = SubprocessRunner::new();
        let output = Rc::new(RefCell::new(Vec::new()));
        let sink = output.clone();
        runner.invoke(
            "echo to-stdout && echo to-stderr >&2",
            "",
            Box::new(move |result| {
                assert!(result.success());
                *sink.borrow_mut() = result.output;
            }),
        );
        run_to_completion(&mut runner);
        let text = String::from_utf8(output.borrow().clone()).unwrap();
        assert!(text.contains("to-stdout"));
        assert!(text.contains("to-stderr"));
    }

    #[test]
    fn reports_failure_exit() {
        let mut runner = SubprocessRunner::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        runner.invoke(
            "exit 3",
            "",
            Box::new(move |result| {
                *sink.borrow_mut() = Some(result.termination);
            }),
        );
        run_to_completion(&mut runner);
        assert_eq!(*seen.borrow(), Some(Termination::Failure));
    }

    #[test]
    fn callbacks_fire_once_per_command() {
        let mut runner = SubprocessRunner::new();
        let count = Rc::new(RefCell::new(0));
        for n in 0..4 {
            let count = count.clone();
            runner.invoke(
                &format!("exit {}", n % 2),
                "",
                Box::new(move |_| {
                    *count.borrow_mut() += 1;
                }),
            );
        }
        run_to_completion(&mut runner);
        assert_eq!(*count.borrow(), 4);
    }
}
