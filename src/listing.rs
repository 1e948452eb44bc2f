//! Filtered directory listing.
//!
//! The directory is read by the gate itself (reads are never denied); each
//! entry is then handed to the predicate inside the predicate's own frame.
//! One failing entry fails the whole listing: a partially filtered result
//! would hide a sandbox violation from the caller.

use std::path::Path;

use crate::config::Isolation;
use crate::predicate::Predicate;
use crate::sandbox::{ops, seccomp};
use crate::GateError;

/// Names of every entry in `dir`, sorted.
pub fn list_all(dir: &Path) -> Result<Vec<String>, GateError> {
    let mut names = entry_names(dir)?;
    names.sort();
    Ok(names)
}

/// Names of the entries in `dir` the predicate accepts, sorted.
pub fn list_names(
    dir: &Path,
    predicate: &Predicate,
    isolation: Isolation,
) -> Result<Vec<String>, GateError> {
    let mut names = match isolation {
        Isolation::InProcess => filter_entries(dir, predicate)?,
        Isolation::Seccomp => seccomp::run_isolated(|| filter_entries(dir, predicate))?,
    };
    names.sort();
    log::debug!(
        "{} accepted {} entries of {} ({})",
        predicate.descriptor().name(),
        names.len(),
        dir.display(),
        isolation.as_str()
    );
    Ok(names)
}

fn entry_names(dir: &Path) -> Result<Vec<String>, GateError> {
    let mut names = Vec::new();
    for entry in ops::read_dir(dir)? {
        let entry = entry?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

fn filter_entries(dir: &Path, predicate: &Predicate) -> Result<Vec<String>, GateError> {
    let mut accepted = Vec::new();
    for name in entry_names(dir)? {
        if predicate.accept_entry(dir, &name)? {
            accepted.push(name);
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::FilenamePredicate;
    use crate::{ClassDescriptor, Interface};
    use std::sync::Arc;

    struct LongNames(usize);

    impl FilenamePredicate for LongNames {
        fn descriptor(&self) -> Arc<ClassDescriptor> {
            Arc::new(
                ClassDescriptor::new("test.LongNames")
                    .unwrap()
                    .implementing(Interface::FilenamePredicate),
            )
        }

        fn accept(&self, _dir: &Path, name: &str) -> Result<bool, GateError> {
            Ok(name.len() > self.0)
        }
    }

    struct Broken;

    impl FilenamePredicate for Broken {
        fn descriptor(&self) -> Arc<ClassDescriptor> {
            Arc::new(
                ClassDescriptor::new("test.Broken")
                    .unwrap()
                    .implementing(Interface::FilenamePredicate),
            )
        }

        fn accept(&self, _dir: &Path, name: &str) -> Result<bool, GateError> {
            if name == "b" {
                return Err(GateError::InvalidArgument("cannot judge b".to_string()));
            }
            Ok(true)
        }
    }

    fn scratch(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        dir
    }

    #[test]
    fn accepted_names_come_back_sorted() {
        let dir = scratch(&["zeta.txt", "a", "mid.log", "bb"]);
        let predicate = Predicate::Filename(Arc::new(LongNames(2)));
        let names = list_names(dir.path(), &predicate, Isolation::InProcess).unwrap();
        assert_eq!(names, vec!["mid.log", "zeta.txt"]);
        assert_eq!(list_all(dir.path()).unwrap(), vec!["a", "bb", "mid.log", "zeta.txt"]);
    }

    #[test]
    fn one_failing_entry_fails_the_listing() {
        let dir = scratch(&["a", "b", "c"]);
        let predicate = Predicate::Filename(Arc::new(Broken));
        assert!(matches!(
            list_names(dir.path(), &predicate, Isolation::InProcess),
            Err(GateError::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_directory_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let predicate = Predicate::Filename(Arc::new(LongNames(0)));
        assert!(matches!(
            list_names(&dir.path().join("gone"), &predicate, Isolation::InProcess),
            Err(GateError::Io(_))
        ));
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn isolated_listing_matches_in_process() {
        let dir = scratch(&["one", "three", "seventeen"]);
        let predicate = Predicate::Filename(Arc::new(LongNames(3)));
        let isolated = list_names(dir.path(), &predicate, Isolation::Seccomp).unwrap();
        let local = list_names(dir.path(), &predicate, Isolation::InProcess).unwrap();
        assert_eq!(isolated, local);
        assert_eq!(isolated, vec!["seventeen", "three"]);
    }
}
