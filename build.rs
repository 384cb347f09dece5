use std::fs;
use std::path::Path;

const HOOK_SRC: &str = "scripts/pre-commit";
const HOOK_DST: &str = ".git/hooks/pre-commit";

fn main() {
    println!("cargo:rerun-if-changed={HOOK_SRC}");

    // Best effort: skip outside a git checkout (e.g. a crates.io build).
    if Path::new(".git/hooks").exists() && Path::new(HOOK_SRC).exists() {
        install_pre_commit_hook();
    }
}

fn install_pre_commit_hook() {
    if hook_is_current() {
        return;
    }

    match fs::copy(HOOK_SRC, HOOK_DST) {
        Ok(_) => {
            make_executable(HOOK_DST);
            println!("cargo:warning=Installed pre-commit hook (fmt + clippy checks)");
        }
        Err(e) => println!("cargo:warning=Failed to install pre-commit hook: {e}"),
    }
}

fn hook_is_current() -> bool {
    match (fs::read(HOOK_SRC), fs::read(HOOK_DST)) {
        (Ok(src), Ok(dst)) => src == dst,
        _ => false,
    }
}

#[cfg(unix)]
fn make_executable(path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o755));
}

#[cfg(not(unix))]
fn make_executable(_path: &str) {}
