use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// (source under shaders/, glslc stage, output name expected by the renderer)
const RT_SHADERS: [(&str, &str, &str); 4] = [
    ("raygen.rgen.glsl", "rgen", "raygen.spv"),
    ("miss.rmiss.glsl", "rmiss", "miss.spv"),
    ("closest_hit.rchit.glsl", "rchit", "closest_hit.spv"),
    ("intersection.rint.glsl", "rint", "intersection.spv"),
];

fn main() {
    let dest = env::var("OUT_DIR").unwrap();
    let spirv_dir = Path::new(&dest).join("spirv");
    fs::create_dir_all(&spirv_dir).unwrap();

    // The renderer's default shader directory, whether or not compilation happens
    println!("cargo:rustc-env=VOXRT_SPIRV_DIR={}", spirv_dir.display());
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    // ========================================================================
    // SPIR-V Shader Compilation (via glslc from the Vulkan SDK)
    // ========================================================================
    // Ray tracing stages need SPIR-V 1.4, available from Vulkan 1.2.
    let shader_dir = Path::new("shaders");
    for (filename, _, _) in &RT_SHADERS {
        println!("cargo:rerun-if-changed=shaders/{filename}");
    }

    let Some(glslc) = find_glslc() else {
        println!(
            "cargo:warning=glslc not found; shaders were not compiled. \
             Install the Vulkan SDK or point VOXRT_SHADER_DIR at precompiled SPIR-V."
        );
        return;
    };

    let mut any_failed = false;
    for (filename, stage, spv_name) in &RT_SHADERS {
        let src_path = shader_dir.join(filename);
        let spv_path = spirv_dir.join(spv_name);
        any_failed |= !compile_shader(&glslc, &src_path, &spv_path, stage, filename);
    }

    if any_failed {
        panic!("Some shaders failed to compile (see warnings above)");
    }
}

/// Compile a single shader file to SPIR-V.
fn compile_shader(glslc: &Path, src_path: &Path, spv_path: &Path, stage: &str, filename: &str) -> bool {
    let output = Command::new(glslc)
        .arg(format!("-fshader-stage={stage}"))
        .args(["--target-env=vulkan1.2", "--target-spv=spv1.4", "-O", "-o"])
        .arg(spv_path)
        .arg(src_path)
        .output();

    match output {
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if result.status.success() {
                if !stderr.is_empty() {
                    println!("cargo:warning=glslc {filename}: {stderr}");
                }
                true
            } else {
                println!("cargo:warning=glslc FAILED {filename}: {stderr}");
                false
            }
        }
        Err(e) => {
            println!("cargo:warning=glslc: failed to run for {filename}: {e}");
            false
        }
    }
}

/// Find glslc: PATH first, then $VULKAN_SDK.
fn find_glslc() -> Option<PathBuf> {
    if let Ok(output) = Command::new("glslc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("glslc"));
        }
    }

    let sdk = PathBuf::from(env::var_os("VULKAN_SDK")?);
    ["bin/glslc", "Bin/glslc.exe", "bin/glslc.exe"]
        .iter()
        .map(|relative| sdk.join(relative))
        .find(|path| path.exists())
}
