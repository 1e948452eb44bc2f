//! Predicate execution sandbox.
//!
//! The sandbox is a process-wide guard installed once and never removed. It
//! is consulted before every sensitive operation (see [`ops`]) and denies the
//! operation iff the calling thread's frame stack holds a predicate frame.
//! The decision is structural: it looks only at which code is executing,
//! never at who asked for it.
//!
//! Frames are pushed by the crate's own entry points ([`enter`]), so the
//! stack witness is always local to the calling thread and needs no locking.

use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::{predicate, ClassDescriptor, GateError};

pub mod ops;
pub mod seccomp;

thread_local! {
    static FRAMES: RefCell<Vec<(u64, Arc<ClassDescriptor>)>> = const { RefCell::new(Vec::new()) };
    static NEXT_FRAME_ID: Cell<u64> = const { Cell::new(0) };
}

static SANDBOX: OnceLock<Sandbox> = OnceLock::new();

// -------------------- Operations --------------------

/// Security-sensitive operations the host checks before performing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Read(PathBuf),
    Write(PathBuf),
    Delete(PathBuf),
    CreateLoader,
    Exit(i32),
    Link(String),
    Exec(String),
    Connect(String),
    Listen(String),
    Accept(String),
    Multicast(IpAddr),
    /// Generic capability check.
    Permission(String),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Delete,
    CreateLoader,
    Exit,
    Link,
    Exec,
    Connect,
    Listen,
    Accept,
    Multicast,
    Permission,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Delete => "delete",
            OperationKind::CreateLoader => "create_loader",
            OperationKind::Exit => "exit",
            OperationKind::Link => "link",
            OperationKind::Exec => "exec",
            OperationKind::Connect => "connect",
            OperationKind::Listen => "listen",
            OperationKind::Accept => "accept",
            OperationKind::Multicast => "multicast",
            OperationKind::Permission => "permission",
        }
    }

    /// Predicates must read metadata to decide; generic permission checks
    /// belong to the host's own permission model.
    pub fn always_granted(self) -> bool {
        matches!(self, OperationKind::Read | OperationKind::Permission)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Read(_) => OperationKind::Read,
            Operation::Write(_) => OperationKind::Write,
            Operation::Delete(_) => OperationKind::Delete,
            Operation::CreateLoader => OperationKind::CreateLoader,
            Operation::Exit(_) => OperationKind::Exit,
            Operation::Link(_) => OperationKind::Link,
            Operation::Exec(_) => OperationKind::Exec,
            Operation::Connect(_) => OperationKind::Connect,
            Operation::Listen(_) => OperationKind::Listen,
            Operation::Accept(_) => OperationKind::Accept,
            Operation::Multicast(_) => OperationKind::Multicast,
            Operation::Permission(_) => OperationKind::Permission,
        }
    }

    pub fn target(&self) -> String {
        match self {
            Operation::Read(path) | Operation::Write(path) | Operation::Delete(path) => {
                path.display().to_string()
            }
            Operation::CreateLoader => "class loader".to_string(),
            Operation::Exit(code) => format!("status {code}"),
            Operation::Link(name)
            | Operation::Exec(name)
            | Operation::Connect(name)
            | Operation::Listen(name)
            | Operation::Accept(name)
            | Operation::Permission(name) => name.clone(),
            Operation::Multicast(group) => group.to_string(),
        }
    }
}

// -------------------- Violations --------------------

/// A sensitive operation attempted from inside predicate execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub operation: OperationKind,
    pub target: String,
    /// Innermost frame at the time of the attempt.
    pub frame: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sandbox: {} of {} denied inside predicate execution (caller {})",
            self.operation, self.target, self.frame
        )
    }
}

// -------------------- Frames --------------------

/// Keeps a frame on the calling thread's stack until dropped.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    id: u64,
    // Frames are thread-local; the guard must be dropped where it was made.
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // Removes this guard's own frame even when guards drop out of order.
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if let Some(pos) = frames.iter().rposition(|(id, _)| *id == self.id) {
                frames.remove(pos);
            }
        });
    }
}

/// Pushes `class` onto the calling thread's frame stack.
pub fn enter(class: Arc<ClassDescriptor>) -> FrameGuard {
    let id = NEXT_FRAME_ID.with(|next| {
        let id = next.get();
        next.set(id.wrapping_add(1));
        id
    });
    FRAMES.with(|frames| frames.borrow_mut().push((id, class)));
    FrameGuard {
        id,
        _thread_bound: PhantomData,
    }
}

/// Point-in-time snapshot of the calling thread's frames, outermost first.
#[derive(Clone, Debug, Default)]
pub struct StackWitness {
    frames: Vec<Arc<ClassDescriptor>>,
}

impl StackWitness {
    pub fn capture() -> Self {
        FRAMES.with(|frames| Self {
            frames: frames.borrow().iter().map(|(_, class)| class.clone()).collect(),
        })
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn innermost(&self) -> Option<&ClassDescriptor> {
        self.frames.last().map(|f| f.as_ref())
    }

    pub fn has_predicate_frame(&self) -> bool {
        self.frames
            .iter()
            .any(|frame| matches!(predicate::is_predicate(Some(frame)), Ok(true)))
    }
}

// -------------------- Sandbox --------------------

/// The installed guard. It carries no state of its own beyond being present.
#[derive(Debug)]
pub struct Sandbox {
    _installed: (),
}

impl Sandbox {
    /// Installs the process-wide sandbox. Later calls return the same guard.
    pub fn install() -> &'static Sandbox {
        let mut fresh = false;
        let sandbox = SANDBOX.get_or_init(|| {
            fresh = true;
            Sandbox { _installed: () }
        });
        if fresh {
            log::info!("predicate sandbox installed for process lifetime");
        }
        sandbox
    }

    pub fn installed() -> Option<&'static Sandbox> {
        SANDBOX.get()
    }

    /// Denies `op` if a predicate frame is executing on this thread.
    pub fn check(&self, op: &Operation) -> Result<(), GateError> {
        let kind = op.kind();
        if kind.always_granted() {
            return Ok(());
        }
        let witness = StackWitness::capture();
        if !witness.has_predicate_frame() {
            return Ok(());
        }
        let violation = Violation {
            operation: kind,
            target: op.target(),
            frame: witness
                .innermost()
                .map(|f| f.name().to_string())
                .unwrap_or_default(),
        };
        log::warn!("{}", violation);
        Err(GateError::SandboxViolation(violation))
    }
}

/// Checks `op` against the installed sandbox. Before installation every
/// operation proceeds.
pub fn check(op: &Operation) -> Result<(), GateError> {
    match Sandbox::installed() {
        Some(sandbox) => sandbox.check(op),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Interface;

    fn predicate_class() -> Arc<ClassDescriptor> {
        Arc::new(
            ClassDescriptor::new("test.SuffixFilter")
                .unwrap()
                .implementing(Interface::FilenamePredicate),
        )
    }

    fn service_class() -> Arc<ClassDescriptor> {
        Arc::new(
            ClassDescriptor::new("test.ListService")
                .unwrap()
                .implementing(Interface::RequiresAuth),
        )
    }

    #[test]
    fn frames_pop_when_guards_drop() {
        assert_eq!(StackWitness::capture().depth(), 0);
        {
            let _outer = enter(service_class());
            let _inner = enter(predicate_class());
            assert_eq!(StackWitness::capture().depth(), 2);
        }
        assert_eq!(StackWitness::capture().depth(), 0);
    }

    #[test]
    fn out_of_order_drop_keeps_the_predicate_frame() {
        let outer = enter(service_class());
        let inner = enter(predicate_class());
        drop(outer);

        let witness = StackWitness::capture();
        assert_eq!(witness.depth(), 1);
        assert!(witness.has_predicate_frame());
        assert_eq!(witness.innermost().map(|c| c.name()), Some("test.SuffixFilter"));

        drop(inner);
        assert_eq!(StackWitness::capture().depth(), 0);
    }

    #[test]
    fn denies_mutation_only_inside_predicate_frames() {
        let sandbox = Sandbox::install();
        let delete = Operation::Delete(PathBuf::from("/tmp/victim"));

        assert!(sandbox.check(&delete).is_ok());
        {
            let _svc = enter(service_class());
            assert!(sandbox.check(&delete).is_ok());
        }

        let _pred = enter(predicate_class());
        match sandbox.check(&delete) {
            Err(GateError::SandboxViolation(v)) => {
                assert_eq!(v.operation, OperationKind::Delete);
                assert_eq!(v.frame, "test.SuffixFilter");
                assert_eq!(v.target, "/tmp/victim");
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn reads_and_generic_permissions_always_pass() {
        let sandbox = Sandbox::install();
        let _pred = enter(predicate_class());
        assert!(sandbox.check(&Operation::Read(PathBuf::from("/etc/hosts"))).is_ok());
        assert!(sandbox
            .check(&Operation::Permission("getenv.HOME".to_string()))
            .is_ok());
        assert!(sandbox.check(&Operation::Exec("/bin/sh".to_string())).is_err());
        assert!(sandbox
            .check(&Operation::Connect("127.0.0.1:80".to_string()))
            .is_err());
    }

    #[test]
    fn predicate_frame_anywhere_on_the_stack_counts() {
        let sandbox = Sandbox::install();
        let _pred = enter(predicate_class());
        let _helper = enter(service_class());
        let err = sandbox
            .check(&Operation::Write(PathBuf::from("/tmp/out")))
            .unwrap_err();
        match err {
            // The innermost frame is named, even if it is not the predicate.
            GateError::SandboxViolation(v) => assert_eq!(v.frame, "test.ListService"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn frames_are_per_thread() {
        let sandbox = Sandbox::install();
        let _pred = enter(predicate_class());
        let other = std::thread::spawn(|| {
            Sandbox::install()
                .check(&Operation::Delete(PathBuf::from("/tmp/x")))
                .is_ok()
        })
        .join()
        .unwrap();
        assert!(other);
        assert!(sandbox.check(&Operation::Exit(1)).is_err());
    }

    #[test]
    fn install_is_idempotent() {
        let a = Sandbox::install() as *const Sandbox;
        let b = Sandbox::install() as *const Sandbox;
        assert_eq!(a, b);
        assert!(Sandbox::installed().is_some());
    }
}
