use std::path::PathBuf;

fn main() {
    let build_trt = std::env::var("CARGO_FEATURE_TRT_BACKEND").is_ok();

    if build_trt {
        let cpp_root = PathBuf::from("../inference-cpp");
        let src_dir = cpp_root.join("src");
        let include_dir = cpp_root.join("include");

        let cuda_root =
            std::env::var("CUDA_ROOT").unwrap_or_else(|_| "/usr/local/cuda".to_string());
        let trt_root =
            std::env::var("TENSORRT_ROOT").unwrap_or_else(|_| "/usr/local/tensorrt".to_string());

        let cuda_include = PathBuf::from(&cuda_root).join("include");
        let cuda_lib = first_existing(&cuda_root, &["lib64", "lib/x86_64-linux-gnu", "lib"]);

        let trt_include = PathBuf::from(&trt_root).join("include");
        let trt_lib = first_existing(&trt_root, &["lib", "lib/x86_64-linux-gnu", "lib64"]);

        cxx_build::bridge("src/backend/trt.rs")
            .file(src_dir.join("trt_engine.cpp"))
            .include(&include_dir)
            .include(&cuda_include)
            .include(&trt_include)
            .flag_if_supported("-std=c++17")
            .flag_if_supported("-Wno-unused-parameter")
            .compile("inference-trt");

        println!(
            "cargo:rerun-if-changed={}",
            src_dir.join("trt_engine.cpp").display()
        );
        println!(
            "cargo:rerun-if-changed={}",
            include_dir.join("trt_engine.hpp").display()
        );
        println!("cargo:rerun-if-changed=src/backend/trt.rs");

        println!("cargo:rustc-link-search=native={}", cuda_lib.display());
        println!("cargo:rustc-link-search=native={}", trt_lib.display());

        println!("cargo:rustc-link-lib=cudart");
        println!("cargo:rustc-link-lib=nvinfer");
    }
}

/// First of `candidates` under `root` that exists, falling back to the last one.
fn first_existing(root: &str, candidates: &[&str]) -> PathBuf {
    let root = PathBuf::from(root);
    candidates
        .iter()
        .map(|c| root.join(c))
        .find(|p| p.exists())
        .unwrap_or_else(|| root.join(candidates[candidates.len() - 1]))
}
