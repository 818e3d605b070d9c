#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Mutex, OnceLock};

use quarry::{Elf, VirtAddr};

/// Compile a C target from `tests/targets/` as a fixed-address (non-PIE)
/// binary and return its path. Each target is built once per test binary;
/// concurrent tests share the artifact.
///
/// Launching disables address randomization, so symbol values from the
/// image are the run-time addresses.
pub fn build_target(name: &str) -> PathBuf {
    static BUILT: OnceLock<Mutex<HashMap<String, PathBuf>>> = OnceLock::new();

    let mut built = BUILT
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap();
    if let Some(out) = built.get(name) {
        return out.clone();
    }

    let source = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/targets")
        .join(format!("{name}.c"));
    let out = PathBuf::from(env!("CARGO_TARGET_TMPDIR"))
        .join(format!("{name}-{}", std::process::id()));

    let status = Command::new("cc")
        .args(["-O0", "-g0", "-no-pie", "-fno-pie", "-o"])
        .arg(&out)
        .arg(&source)
        .status()
        .expect("cc is required to build test targets");
    assert!(status.success(), "failed to compile test target {name}");

    built.insert(name.to_owned(), out.clone());
    out
}

/// Run-time address of `name` in a non-PIE image loaded without
/// randomization.
pub fn symbol_addr(elf: &Elf, name: &str) -> VirtAddr {
    let symbols = elf.symbols_by_name(name);
    assert!(!symbols.is_empty(), "no symbol named {name}");
    VirtAddr::new(symbols[0].value)
}
