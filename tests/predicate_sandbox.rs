use std::path::Path;
use std::sync::Arc;

use callgate::codec::{encode_filter, rebuild_predicate, DEFAULT_MAX_BLOB_BYTES};
use callgate::listing::list_names;
use callgate::predicate::{FilePredicate, FilenamePredicate};
use callgate::sandbox::ops;
use callgate::{
    ClassDescriptor, FilterSpec, GateError, Interface, Isolation, OperationKind, Predicate,
    PredicateRegistry, Sandbox,
};

/// Tries to delete every entry it inspects.
struct Shredder;

impl FilePredicate for Shredder {
    fn descriptor(&self) -> Arc<ClassDescriptor> {
        Arc::new(
            ClassDescriptor::new("plugins.Shredder")
                .unwrap()
                .implementing(Interface::FilePredicate),
        )
    }

    fn accept(&self, path: &Path) -> Result<bool, GateError> {
        ops::remove_file(path)?;
        Ok(true)
    }
}

/// Bypasses the guarded surface and deletes with the standard library.
struct RawShredder;

impl FilePredicate for RawShredder {
    fn descriptor(&self) -> Arc<ClassDescriptor> {
        Arc::new(
            ClassDescriptor::new("plugins.RawShredder")
                .unwrap()
                .implementing(Interface::FilePredicate),
        )
    }

    fn accept(&self, path: &Path) -> Result<bool, GateError> {
        std::fs::remove_file(path)?;
        Ok(true)
    }
}

/// Deletes through the guarded surface while its descriptor claims it is an
/// ordinary service class.
struct Disguised;

impl FilePredicate for Disguised {
    fn descriptor(&self) -> Arc<ClassDescriptor> {
        Arc::new(
            ClassDescriptor::new("plugins.Disguised")
                .unwrap()
                .implementing(Interface::RequiresAuth),
        )
    }

    fn accept(&self, path: &Path) -> Result<bool, GateError> {
        ops::remove_file(path)?;
        Ok(true)
    }
}

/// Reads attributes only: accepts non-empty regular files.
struct NonEmpty;

impl FilenamePredicate for NonEmpty {
    fn descriptor(&self) -> Arc<ClassDescriptor> {
        Arc::new(
            ClassDescriptor::new("plugins.NonEmpty")
                .unwrap()
                .implementing(Interface::FilenamePredicate),
        )
    }

    fn accept(&self, dir: &Path, name: &str) -> Result<bool, GateError> {
        let meta = ops::metadata(dir.join(name))?;
        Ok(meta.is_file() && meta.len() > 0)
    }
}

fn registry() -> PredicateRegistry {
    let mut registry = PredicateRegistry::new();
    registry.register("shredder", |_| Ok(Predicate::File(Arc::new(Shredder))));
    registry.register("raw_shredder", |_| Ok(Predicate::File(Arc::new(RawShredder))));
    registry.register("disguised", |_| Ok(Predicate::File(Arc::new(Disguised))));
    registry.register("non_empty", |_| Ok(Predicate::Filename(Arc::new(NonEmpty))));
    registry
}

fn populate() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(dir.path().join("b.txt"), b"").unwrap();
    std::fs::write(dir.path().join("c.log"), b"gamma").unwrap();
    std::fs::create_dir(dir.path().join("d.txt")).unwrap();
    dir
}

fn list(dir: &Path, spec: &FilterSpec, isolation: Isolation) -> Result<Vec<String>, GateError> {
    let blob = encode_filter(spec).unwrap();
    let predicate = rebuild_predicate(&blob, &registry(), DEFAULT_MAX_BLOB_BYTES)?;
    list_names(dir, &predicate, isolation)
}

fn assert_delete_violation(result: Result<Vec<String>, GateError>) {
    match result {
        Err(GateError::SandboxViolation(v)) => {
            assert_eq!(v.operation, OperationKind::Delete);
            assert!(v.to_string().contains("delete"));
        }
        other => panic!("expected a delete violation, got {other:?}"),
    }
}

#[test]
fn deleting_predicate_fails_the_listing_and_deletes_nothing() {
    Sandbox::install();
    let dir = populate();

    let result = list(
        dir.path(),
        &FilterSpec::custom("shredder", serde_json::Value::Null),
        Isolation::InProcess,
    );
    match &result {
        Err(GateError::SandboxViolation(v)) => assert_eq!(v.frame, "plugins.Shredder"),
        other => panic!("unexpected {other:?}"),
    }
    assert_delete_violation(result);

    for name in ["a.txt", "b.txt", "c.log", "d.txt"] {
        assert!(dir.path().join(name).exists(), "{name} was deleted");
    }
}

#[test]
fn predicate_with_a_non_predicate_descriptor_is_still_sandboxed() {
    Sandbox::install();
    let dir = populate();

    let direct = Predicate::File(Arc::new(Disguised));
    let result = list_names(dir.path(), &direct, Isolation::InProcess);
    match &result {
        Err(GateError::SandboxViolation(v)) => assert_eq!(v.frame, "plugins.Disguised"),
        other => panic!("unexpected {other:?}"),
    }
    assert_delete_violation(result);

    assert_delete_violation(list(
        dir.path(),
        &FilterSpec::custom("disguised", serde_json::Value::Null),
        Isolation::InProcess,
    ));

    for name in ["a.txt", "b.txt", "c.log", "d.txt"] {
        assert!(dir.path().join(name).exists(), "{name} was deleted");
    }
}

#[test]
fn attribute_reading_predicate_verdicts_are_respected() {
    Sandbox::install();
    let dir = populate();

    let names = list(
        dir.path(),
        &FilterSpec::custom("non_empty", serde_json::Value::Null),
        Isolation::InProcess,
    )
    .unwrap();
    assert_eq!(names, vec!["a.txt", "c.log"]);

    let names = list(
        dir.path(),
        &FilterSpec::all(vec![FilterSpec::suffix(".txt"), FilterSpec::FileOnly]),
        Isolation::InProcess,
    )
    .unwrap();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    let names = list(
        dir.path(),
        &FilterSpec::LargerThan { bytes: 0 },
        Isolation::InProcess,
    )
    .unwrap();
    assert!(names.contains(&"a.txt".to_string()));
    assert!(!names.contains(&"b.txt".to_string()));
}

#[test]
fn txt_filter_survives_a_separate_decode() {
    Sandbox::install();
    let dir = populate();
    let blob = encode_filter(&FilterSpec::suffix(".txt")).unwrap();

    // Rebuilt from the blob text alone, with a registry built afresh.
    let predicate = rebuild_predicate(&blob, &PredicateRegistry::new(), 4096).unwrap();
    let names = list_names(dir.path(), &predicate, Isolation::InProcess).unwrap();
    assert_eq!(names, vec!["a.txt", "b.txt", "d.txt"]);
}

#[test]
fn wide_filters_round_trip_and_are_sandboxed_identically() {
    Sandbox::install();
    let dir = populate();
    let shredder = FilterSpec::custom("shredder", serde_json::Value::Null);

    let narrow = FilterSpec::all(vec![shredder.clone()]);
    let mut chained: Vec<FilterSpec> = (0..500).map(|_| FilterSpec::prefix("")).collect();
    chained.push(shredder);
    let wide = FilterSpec::all(chained);

    let wide_blob = encode_filter(&wide).unwrap();
    assert!(wide_blob.len() > encode_filter(&narrow).unwrap().len() * 100);

    assert_delete_violation(list(dir.path(), &narrow, Isolation::InProcess));
    assert_delete_violation(list(dir.path(), &wide, Isolation::InProcess));
    assert!(dir.path().join("a.txt").exists());

    let mut harmless: Vec<FilterSpec> = (0..500).map(|_| FilterSpec::prefix("")).collect();
    harmless.push(FilterSpec::suffix(".log"));
    assert_eq!(
        list(dir.path(), &FilterSpec::all(harmless), Isolation::InProcess).unwrap(),
        vec!["c.log"]
    );
}

#[test]
fn sandbox_only_applies_inside_predicate_frames() {
    Sandbox::install();
    let dir = populate();
    ops::remove_file(dir.path().join("c.log")).unwrap();
    assert!(!dir.path().join("c.log").exists());
}

#[test]
fn unknown_predicates_are_distinct_from_malformed_blobs() {
    let dir = populate();
    let err = list(
        dir.path(),
        &FilterSpec::custom("not_installed", serde_json::Value::Null),
        Isolation::InProcess,
    )
    .unwrap_err();
    assert!(matches!(err, GateError::PredicateUnresolvable(_)));

    let err = rebuild_predicate("%%%", &registry(), DEFAULT_MAX_BLOB_BYTES).unwrap_err();
    assert!(matches!(err, GateError::BlobMalformed(_)));
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn seccomp_child_blocks_unguarded_deletes() {
    let dir = populate();
    let result = list(
        dir.path(),
        &FilterSpec::custom("raw_shredder", serde_json::Value::Null),
        Isolation::Seccomp,
    );
    match result {
        Err(GateError::Io(err)) => assert_eq!(err.raw_os_error(), Some(libc::EPERM)),
        other => panic!("expected EPERM, got {other:?}"),
    }
    for name in ["a.txt", "b.txt", "c.log"] {
        assert!(dir.path().join(name).exists(), "{name} was deleted");
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn seccomp_listing_reports_sandbox_violations() {
    Sandbox::install();
    let dir = populate();
    assert_delete_violation(list(
        dir.path(),
        &FilterSpec::custom("shredder", serde_json::Value::Null),
        Isolation::Seccomp,
    ));
}
