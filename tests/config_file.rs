use std::path::Path;
use vk_rhi::backend::PipelineVariant;
use vk_rhi::config::Config;

#[test]
fn shipped_config_parses() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml");
    let config = Config::load_from_path(&path).unwrap();

    let desc = config.renderer_desc().unwrap();
    assert_eq!(desc.variant, PipelineVariant::Mesh);
    assert_eq!(desc.fence_timeout, None);
    assert_eq!(desc.present_mode, None);
    assert!(config.assets.mesh.is_none());
    assert!(config.debug.validation_layers);
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let config = Config::load_from_path("no/such/config.toml").unwrap();
    assert_eq!(config.window.title, "vk-rhi");
    assert_eq!(config.graphics.pipeline, "mesh");
}

#[test]
fn every_variant_has_shader_paths() {
    let config = Config::default();
    for name in ["triangle", "mesh", "uniform"] {
        let variant: PipelineVariant = name.parse().unwrap();
        let vertex = config.assets.vertex_shader_path(variant);
        assert!(vertex.ends_with(format!("{}.vert.spv", name)));
        let fragment = config.assets.fragment_shader_path(variant);
        assert!(fragment.ends_with(format!("{}.frag.spv", name)));
    }
}
