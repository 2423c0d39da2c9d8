// Build script to compile GLSL shaders to SPIR-V
//
// Every shaders/<name>.<stage> becomes shaders/<name>.<stage>.spv. A missing
// or failing glslc only produces warnings; the binary reports unreadable
// shaders at startup.

use std::path::Path;
use std::process::Command;

const RASTER_STAGES: &[&str] = &["vert", "frag"];
const RAY_TRACING_STAGES: &[&str] = &["rgen", "rmiss", "rchit"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    let entries = match std::fs::read_dir("shaders") {
        Ok(entries) => entries,
        Err(e) => {
            println!("cargo:warning=No shaders/ directory ({})", e);
            return;
        }
    };

    let mut sources: Vec<_> = entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect();
    sources.sort();

    for input in sources {
        let Some(ext) = input.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        let ray_tracing = RAY_TRACING_STAGES.contains(&ext);
        if !ray_tracing && !RASTER_STAGES.contains(&ext) {
            continue;
        }
        println!("cargo:rerun-if-changed={}", input.display());

        let output = input.with_extension(format!("{}.spv", ext));
        if !compile_shader(&input, &output, ray_tracing) {
            // glslc is absent; no point trying the rest
            return;
        }
    }
}

/// Returns false when glslc cannot be run at all
fn compile_shader(input: &Path, output: &Path, ray_tracing: bool) -> bool {
    let mut command = Command::new("glslc");
    if ray_tracing {
        // Ray-tracing stages need SPIR-V 1.4+
        command.arg("--target-env=vulkan1.2");
    }
    let result = command.arg(input).arg("-o").arg(output).status();

    match result {
        Ok(status) if status.success() => true,
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input.display(),
                status.code()
            );
            true
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), shaders were not compiled", e);
            println!(
                "cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}",
                input.display(),
                output.display()
            );
            false
        }
    }
}
