//! Privilege-separated credential verifier.
//!
//! Verification runs in a helper process forked before the compositor
//! connection exists, so platform credential machinery never executes in
//! the process that parses untrusted protocol data, and a hung or crashed
//! verification can never stall the lock surface's event loop.
//!
//! Parent and child talk over a socketpair: the parent writes one
//! length-prefixed credential per attempt, the child answers with a single
//! verdict byte. A closed channel is treated exactly like an explicit
//! failure verdict.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use nix::unistd::{fork, getgid, getuid, geteuid, setgid, setuid, ForkResult, Pid, User};
use zeroize::Zeroizing;

use crate::core::errors::{LockError, Result};

const VERDICT_REJECTED: u8 = 0;
const VERDICT_ACCEPTED: u8 = 1;
const VERDICT_UNAVAILABLE: u8 = 2;

/// Longest credential the child will accept, in bytes.
const MAX_CREDENTIAL_LEN: u32 = 4096;

/// Outcome of one verification attempt.
///
/// `Unavailable` means the helper process or its channel failed; callers
/// must treat it like `Rejected` for lock-state purposes and may log it
/// distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
    Unavailable,
}

/// Parent-side handle to the verifier helper process.
pub struct Verifier {
    stream: UnixStream,
    child: Option<Pid>,
    outstanding: bool,
}

impl Verifier {
    /// Fork the helper process. Must be called before connecting to the
    /// display server and before dropping privileges: the child keeps the
    /// elevated euid it needs to read the shadow file.
    pub fn spawn() -> Result<Self> {
        let (parent_end, child_end) = UnixStream::pair()?;

        match unsafe { fork() }.map_err(|e| LockError::verifier(format!("fork failed: {e}")))? {
            ForkResult::Child => {
                drop(parent_end);
                let code = run_child(child_end);
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                tracing::debug!("verifier helper forked (pid {})", child);
                Ok(Self {
                    stream: parent_end,
                    child: Some(child),
                    outstanding: false,
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            child: None,
            outstanding: false,
        }
    }

    /// The fd the event loop watches for verdict readiness.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    /// Hand one credential attempt to the helper. At most one attempt may
    /// be outstanding; the state machine guarantees this by ignoring
    /// submits while `Validating`.
    pub fn submit(&mut self, credential: &str) -> Result<()> {
        if self.outstanding {
            return Err(LockError::verifier("verification already outstanding"));
        }
        let bytes = credential.as_bytes();
        let len = (bytes.len() as u32).to_le_bytes();
        self.stream
            .write_all(&len)
            .and_then(|()| self.stream.write_all(bytes))
            .and_then(|()| self.stream.flush())
            .map_err(|e| LockError::verifier(format!("helper channel write: {e}")))?;
        self.outstanding = true;
        Ok(())
    }

    /// Read the verdict for the outstanding attempt. Any channel error,
    /// including EOF from a dead helper, is `Unavailable`.
    pub fn read_verdict(&mut self) -> Verdict {
        self.outstanding = false;
        let mut byte = [0u8; 1];
        match self.stream.read_exact(&mut byte) {
            Ok(()) => match byte[0] {
                VERDICT_ACCEPTED => Verdict::Accepted,
                VERDICT_REJECTED => Verdict::Rejected,
                _ => Verdict::Unavailable,
            },
            Err(e) => {
                tracing::warn!("verifier channel failed: {e}");
                Verdict::Unavailable
            }
        }
    }
}

impl Drop for Verifier {
    fn drop(&mut self) {
        // Closing our end makes the child's next read fail and exit.
        if let Some(child) = self.child {
            let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGTERM);
            let _ = nix::sys::wait::waitpid(child, None);
        }
    }
}

/// Drop any elevated ids the binary was started with (setuid installs).
/// Called in the parent immediately after the fork.
pub fn drop_privileges() -> Result<()> {
    if getgid() != nix::unistd::getegid() {
        setgid(getgid()).map_err(|e| LockError::verifier(format!("setgid: {e}")))?;
    }
    if getuid() != geteuid() {
        setuid(getuid()).map_err(|e| LockError::verifier(format!("setuid: {e}")))?;
    }
    if getuid() != geteuid() {
        return Err(LockError::verifier("failed to drop privileges"));
    }
    Ok(())
}

// ============================================================================
// Child side
// ============================================================================

fn run_child(mut stream: UnixStream) -> i32 {
    // The credential hash is looked up once; if that fails every attempt
    // answers Unavailable rather than leaking whether the user exists.
    let hash = lookup_shadow_hash();

    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).is_err() {
            // Parent went away; nothing left to do.
            return 0;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_CREDENTIAL_LEN {
            return 1;
        }

        let mut credential = Zeroizing::new(vec![0u8; len as usize]);
        if stream.read_exact(&mut credential).is_err() {
            return 1;
        }

        let verdict = match (&hash, std::str::from_utf8(&credential)) {
            (Some(hash), Ok(pw)) => {
                if pwhash::unix::verify(pw, hash) {
                    VERDICT_ACCEPTED
                } else {
                    VERDICT_REJECTED
                }
            }
            (Some(_), Err(_)) => VERDICT_REJECTED,
            (None, _) => VERDICT_UNAVAILABLE,
        };

        if stream.write_all(&[verdict]).is_err() {
            return 0;
        }
    }
}

/// Read the current user's password hash from the shadow file. Requires
/// the elevated euid the child deliberately keeps.
fn lookup_shadow_hash() -> Option<String> {
    let user = User::from_uid(getuid()).ok().flatten()?;
    let shadow = std::fs::read_to_string("/etc/shadow").ok()?;
    for line in shadow.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some(user.name.as_str()) {
            continue;
        }
        let hash = fields.next()?;
        if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
            // Locked or passwordless account: never unlockable by typing.
            return None;
        }
        return Some(hash.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_child(mut stream: UnixStream, verdict: u8) -> std::thread::JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut credential = vec![0u8; len];
            stream.read_exact(&mut credential).unwrap();
            stream.write_all(&[verdict]).unwrap();
            credential
        })
    }

    #[test]
    fn test_submit_and_rejected_verdict() {
        let (parent, child) = UnixStream::pair().unwrap();
        let handle = stub_child(child, VERDICT_REJECTED);

        let mut verifier = Verifier::from_stream(parent);
        verifier.submit("wrong horse").unwrap();
        assert!(verifier.is_outstanding());
        assert_eq!(verifier.read_verdict(), Verdict::Rejected);
        assert!(!verifier.is_outstanding());
        assert_eq!(handle.join().unwrap(), b"wrong horse");
    }

    #[test]
    fn test_accepted_verdict() {
        let (parent, child) = UnixStream::pair().unwrap();
        let _handle = stub_child(child, VERDICT_ACCEPTED);

        let mut verifier = Verifier::from_stream(parent);
        verifier.submit("correct horse").unwrap();
        assert_eq!(verifier.read_verdict(), Verdict::Accepted);
    }

    #[test]
    fn test_channel_closed_is_unavailable() {
        let (parent, child) = UnixStream::pair().unwrap();
        drop(child);

        let mut verifier = Verifier::from_stream(parent);
        // The write may or may not fail depending on buffering; the verdict
        // read must report Unavailable either way.
        let _ = verifier.submit("anything");
        assert_eq!(verifier.read_verdict(), Verdict::Unavailable);
    }

    #[test]
    fn test_double_submit_is_an_error() {
        let (parent, _child) = UnixStream::pair().unwrap();
        let mut verifier = Verifier::from_stream(parent);
        verifier.submit("one").unwrap();
        assert!(verifier.submit("two").is_err());
    }
}
