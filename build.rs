fn main() {
    // Rerun when a module fixture changes
    println!("cargo:rerun-if-changed=tests/fixtures");

    let fixtures = std::path::Path::new("tests/fixtures");
    if let Ok(entries) = std::fs::read_dir(fixtures) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                println!("cargo:rerun-if-changed={}", path.display());
            }
        }
    }
}
