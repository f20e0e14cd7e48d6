use serde::Deserialize;
use std::{collections::BTreeMap, env, fs, path::PathBuf};

type FlagMap = BTreeMap<String, String>;

#[derive(Deserialize)]
struct Profiles {
    default: FlagMap,
    #[serde(flatten)]
    arch: BTreeMap<String, FlagMap>,
}

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let flags_path = PathBuf::from(manifest_dir).join("../../flags.json");
    let flags_str = fs::read_to_string(&flags_path).unwrap();
    let profiles: Profiles = serde_json::from_str(&flags_str).unwrap();
    // Boards without their own section build with the host defaults.
    let flags = profiles.arch.get(target_arch.as_str()).unwrap_or(&profiles.default);
    make_flags(flags);
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../flags.json");
}

fn make_flags(flagmap: &FlagMap) {
    let mut s = String::from("");
    for (key, value) in flagmap {
        let value: usize = value
            .parse()
            .unwrap_or_else(|_| panic!("Flag '{}' is not an unsigned integer: {}", key, value));
        s += format!("pub const {}: usize = {};\n", key, value).as_str();
    }
    let out_dir = env::var("OUT_DIR").unwrap();
    let path = PathBuf::from(out_dir).join("build_flags.rs");
    fs::write(path, s).unwrap();
}
