use std::env;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    println!("cargo::rustc-check-cfg=cfg(chatglm_bindings)");
    println!("cargo:rerun-if-changed=binding.h");
    println!("cargo:rerun-if-changed=binding.cpp");
    println!("cargo:rerun-if-changed=CMakeLists.txt");
    println!("cargo:rerun-if-env-changed=CHATGLM_PREBUILT_DIR");
    println!("cargo:rerun-if-env-changed=CHATGLM_CPP_DIR");

    // ── Determine build mode ──────────────────────────────────────────
    //
    // Mode A, **prebuilt**: `CHATGLM_PREBUILT_DIR` holds
    //   `lib/{libchatglm_binding.a, libchatglm.a, libggml.a, libsentencepiece.a}`.
    //   CMake is skipped; only linking + bindgen run.
    //
    // Mode B, **CMake**: build the shim together with chatglm.cpp from
    //   `CHATGLM_CPP_DIR`, or from `third_party/chatglm.cpp` at the
    //   workspace root.
    //
    // Neither available: no native symbols are exposed, unless the `required`
    // feature is on, in which case the build fails here.

    let lib_dir = if let Ok(prebuilt) = env::var("CHATGLM_PREBUILT_DIR") {
        let prebuilt = PathBuf::from(&prebuilt);
        assert!(
            prebuilt.exists(),
            "CHATGLM_PREBUILT_DIR={} does not exist",
            prebuilt.display()
        );
        println!(
            "cargo:warning=Using prebuilt chatglm.cpp from {}",
            prebuilt.display()
        );
        if prebuilt.join("lib64").exists() {
            prebuilt.join("lib64")
        } else {
            prebuilt.join("lib")
        }
    } else if let Some(source) = chatglm_source_dir(&manifest_dir) {
        // ── CMake build ───────────────────────────────────────────────
        let mut cfg = cmake::Config::new(&manifest_dir);
        cfg.define("CHATGLM_CPP_DIR", &source)
            .define("BUILD_SHARED_LIBS", "OFF")
            .define("CHATGLM_ENABLE_PYBIND", "OFF")
            .define("CHATGLM_ENABLE_EXAMPLES", "OFF")
            .build_target("chatglm_binding");

        if env::var("CARGO_FEATURE_CUDA").is_ok() {
            cfg.define("GGML_CUBLAS", "ON");
        }
        if env::var("CARGO_FEATURE_METAL").is_ok() || target_os == "macos" {
            cfg.define("GGML_METAL", "ON");
        }

        let dst = cfg.build();
        dst.join("build").join("lib")
    } else {
        let msg = "chatglm.cpp not found (set CHATGLM_PREBUILT_DIR or CHATGLM_CPP_DIR)";
        if env::var("CARGO_FEATURE_REQUIRED").is_ok() {
            panic!("{msg}; the `native` engine cannot be built without it");
        }
        println!("cargo:warning={msg}; native bindings are disabled");
        return;
    };

    // ── Link libraries ────────────────────────────────────────────────
    println!("cargo:rustc-link-search=native={}", lib_dir.display());

    for name in &["chatglm_binding", "chatglm", "ggml", "sentencepiece"] {
        println!("cargo:rustc-link-lib=static={name}");
    }

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        for lib in &["cuda", "cublas", "culibos", "cudart"] {
            println!("cargo:rustc-link-lib={lib}");
        }
    }

    // Platform system libraries
    match target_os.as_str() {
        "linux" => {
            println!("cargo:rustc-link-lib=stdc++");
            println!("cargo:rustc-link-lib=m");
            println!("cargo:rustc-link-lib=pthread");
        }
        "macos" => {
            for fw in &["Accelerate", "Metal", "MetalKit", "Foundation"] {
                println!("cargo:rustc-link-lib=framework={fw}");
            }
            println!("cargo:rustc-link-lib=c++");
        }
        "windows" => {
            println!("cargo:rustc-link-lib=msvcrt");
        }
        _ => {}
    }

    // ── Generate Rust bindings ────────────────────────────────────────
    let bindings = bindgen::Builder::default()
        .header(manifest_dir.join("binding.h").to_string_lossy())
        .allowlist_function("NewGenerationConfig")
        .allowlist_function("DeleteGenerationConfig")
        .allowlist_function("NewPipeline")
        .allowlist_function("DeletePipeline")
        .allowlist_function("Pipeline_Generate")
        .allowlist_function("Chatglm_LastError")
        .allowlist_type("chatglm_stream_callback")
        .opaque_type("GenerationConfig")
        .opaque_type("Pipeline")
        .generate()
        .expect("Failed to generate bindings");

    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out.join("bindings.rs"))
        .expect("Failed to write bindings");

    println!("cargo:rustc-cfg=chatglm_bindings");
}

fn chatglm_source_dir(manifest_dir: &Path) -> Option<PathBuf> {
    let candidate = match env::var("CHATGLM_CPP_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => manifest_dir.join("../../third_party/chatglm.cpp"),
    };
    candidate
        .join("CMakeLists.txt")
        .exists()
        .then_some(candidate)
}
