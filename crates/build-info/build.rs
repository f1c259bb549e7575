use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=JOBD_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");

    if let Some(path) = git_head_path() {
        println!("cargo:rerun-if-changed={}", path);
    }

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git_describe().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("JOBD_BUILD_ID_OVERRIDE")
        .ok()
        .unwrap_or_else(|| format!("{} | {}", build_time, git_label));

    println!("cargo:rustc-env=JOBD_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=JOBD_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=JOBD_BUILD_GIT={}", git_label);
}

fn git_head_path() -> Option<String> {
    let head_path = Path::new(".git/HEAD");
    if !head_path.exists() {
        return None;
    }
    let head_ref = fs::read_to_string(head_path).ok();
    match head_ref.as_deref().and_then(|raw| raw.strip_prefix("ref: ")) {
        Some(path) => {
            let ref_path = format!(".git/{}", path.trim());
            if Path::new(&ref_path).exists() {
                Some(ref_path)
            } else {
                Some(head_path.display().to_string())
            }
        }
        None => Some(head_path.display().to_string()),
    }
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
