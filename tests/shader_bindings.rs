// Every descriptor a shader declares must be visible to that shader's stage
// in the variant's set layout, or pipeline creation is invalid.

use ash::vk;
use std::path::{Path, PathBuf};
use vk_rhi::backend::pipeline::descriptor_bindings;
use vk_rhi::backend::{PipelineVariant, Vertex};

fn shader_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders")
}

/// Value of `key = N` inside a `layout(...)` qualifier
fn qualifier(line: &str, key: &str) -> Option<u32> {
    let line = line.trim();
    if !line.starts_with("layout") {
        return None;
    }
    let at = line.find(key)?;
    let rest = line[at + key.len()..].trim_start().strip_prefix('=')?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Binding numbers from `layout(... binding = N ...)` qualifiers
fn declared_bindings(source: &str) -> Vec<u32> {
    source
        .lines()
        .filter_map(|line| qualifier(line, "binding"))
        .collect()
}

/// Locations of `layout(location = N) in` declarations
fn input_locations(source: &str) -> Vec<u32> {
    source
        .lines()
        .filter(|line| line.contains(") in "))
        .filter_map(|line| qualifier(line, "location"))
        .collect()
}

fn stage_for(file: &str) -> vk::ShaderStageFlags {
    match Path::new(file).extension().and_then(|ext| ext.to_str()) {
        Some("vert") => vk::ShaderStageFlags::VERTEX,
        Some("frag") => vk::ShaderStageFlags::FRAGMENT,
        Some("rgen") => vk::ShaderStageFlags::RAYGEN_KHR,
        Some("rmiss") => vk::ShaderStageFlags::MISS_KHR,
        Some("rchit") => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        other => panic!("unexpected shader extension {:?}", other),
    }
}

fn check(variant: PipelineVariant, files: &[&str]) {
    let layout = descriptor_bindings(variant);
    for file in files {
        let source = std::fs::read_to_string(shader_dir().join(file)).unwrap();
        let stage = stage_for(file);
        for binding in declared_bindings(&source) {
            let spec = layout
                .iter()
                .find(|spec| spec.binding == binding)
                .unwrap_or_else(|| panic!("{} uses binding {} missing from {} layout", file, binding, variant));
            assert!(
                spec.stages.contains(stage),
                "{} uses binding {} but the {} layout exposes it to {:?} only",
                file,
                binding,
                variant,
                spec.stages
            );
        }
    }
}

#[test]
fn binding_parser_reads_layout_qualifiers() {
    let source = "\
// layout(binding = 7) commented out
layout(binding = 0) uniform UniformBufferObject {
layout(set = 0, binding = 2, rgba8) uniform image2D img;
layout(location = 1) in vec3 inColor;
";
    assert_eq!(declared_bindings(source), vec![0, 2]);
}

#[test]
fn raster_shaders_match_standard_layout() {
    check(PipelineVariant::TriangleTest, &["triangle.vert", "triangle.frag"]);
    check(PipelineVariant::Mesh, &["mesh.vert", "mesh.frag"]);
    check(PipelineVariant::Uniform, &["uniform.vert", "uniform.frag"]);
}

#[test]
fn mesh_fragment_stage_only_samples_the_texture() {
    let source = std::fs::read_to_string(shader_dir().join("mesh.frag")).unwrap();
    assert_eq!(declared_bindings(&source), vec![1]);
}

#[test]
fn ray_tracing_shaders_match_their_layout() {
    check(
        PipelineVariant::RayTracing,
        &["raytrace.rgen", "raytrace.rmiss", "raytrace.rchit"],
    );
}

#[test]
fn raster_vertex_shaders_read_the_vertex_layout() {
    let mut expected: Vec<u32> = Vertex::attribute_descriptions()
        .iter()
        .map(|attribute| attribute.location)
        .collect();
    expected.sort();

    for file in ["triangle.vert", "mesh.vert", "uniform.vert"] {
        let source = std::fs::read_to_string(shader_dir().join(file)).unwrap();
        let mut locations = input_locations(&source);
        locations.sort();
        assert_eq!(locations, expected, "{} vertex inputs", file);
    }
}
