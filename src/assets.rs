// =============================================================================
// ASSETS - Shader bytecode, textures and meshes from disk
// =============================================================================
//
// The RHI only ever sees bytes, pixels and vertex arrays. Everything that
// touches the filesystem or a file format lives here.

use crate::backend::{DecodedImage, PipelineVariant, SceneGeometry, ShaderSources, Vertex, Winding};
use crate::config::AssetsConfig;
use anyhow::{bail, Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

/// Read a compiled SPIR-V file
pub fn read_shader(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| {
        format!(
            "Failed to read shader {:?} (was it compiled by build.rs?)",
            path
        )
    })
}

/// Load every stage the variant needs
pub fn load_shader_sources(variant: PipelineVariant, assets: &AssetsConfig) -> Result<ShaderSources> {
    let sources = if variant.requires_ray_tracing() {
        ShaderSources::RayTracing {
            raygen: read_shader(&assets.raygen_shader_path())?,
            miss: read_shader(&assets.miss_shader_path())?,
            closest_hit: read_shader(&assets.closest_hit_shader_path())?,
        }
    } else {
        ShaderSources::Raster {
            vertex: read_shader(&assets.vertex_shader_path(variant))?,
            fragment: read_shader(&assets.fragment_shader_path(variant))?,
        }
    };
    log::debug!("Loaded shaders for {} pipeline", variant);
    Ok(sources)
}

/// Decode an encoded image (PNG, JPEG) into tightly packed RGBA8
pub fn decode_texture(bytes: &[u8]) -> Result<DecodedImage> {
    let rgba = image::load_from_memory(bytes)
        .context("Failed to decode texture")?
        .into_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage::new(width, height, rgba.into_raw())?)
}

pub fn load_texture(path: &Path) -> Result<DecodedImage> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read texture {:?}", path))?;
    let decoded = decode_texture(&bytes).with_context(|| format!("Texture {:?}", path))?;
    log::info!(
        "Loaded texture {:?} ({}x{})",
        path,
        decoded.width,
        decoded.height
    );
    Ok(decoded)
}

/// Parse Wavefront OBJ into one merged, triangulated mesh
pub fn parse_obj<R: BufRead>(reader: &mut R) -> Result<SceneGeometry> {
    let (models, _materials) = tobj::load_obj_buf(
        reader,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
        |_| Ok(Default::default()),
    )
    .context("Failed to parse OBJ")?;

    let mut geometry = SceneGeometry {
        winding: Winding::CounterClockwise,
        ..Default::default()
    };

    for model in &models {
        let mesh = &model.mesh;
        let base = geometry.vertices.len() as u32;
        let vertex_count = mesh.positions.len() / 3;

        for i in 0..vertex_count {
            let color = if mesh.vertex_color.len() >= 3 * (i + 1) {
                [
                    mesh.vertex_color[3 * i],
                    mesh.vertex_color[3 * i + 1],
                    mesh.vertex_color[3 * i + 2],
                ]
            } else {
                [1.0, 1.0, 1.0]
            };
            // OBJ puts v=0 at the bottom of the image
            let tex_coord = if mesh.texcoords.len() >= 2 * (i + 1) {
                [mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1]]
            } else {
                [0.0, 0.0]
            };
            geometry.vertices.push(Vertex {
                position: [
                    mesh.positions[3 * i],
                    mesh.positions[3 * i + 1],
                    mesh.positions[3 * i + 2],
                ],
                color,
                tex_coord,
            });
        }
        geometry
            .indices
            .extend(mesh.indices.iter().map(|&index| base + index));
    }

    if geometry.vertices.is_empty() {
        bail!("OBJ contains no geometry");
    }
    geometry.validate()?;
    Ok(geometry)
}

pub fn load_mesh(path: &Path) -> Result<SceneGeometry> {
    let file = File::open(path).with_context(|| format!("Failed to open mesh {:?}", path))?;
    let geometry =
        parse_obj(&mut BufReader::new(file)).with_context(|| format!("Mesh {:?}", path))?;
    log::info!(
        "Loaded mesh {:?} ({} vertices, {} indices)",
        path,
        geometry.vertices.len(),
        geometry.indices.len()
    );
    Ok(geometry)
}

/// Configured mesh, or the built-in triangle
pub fn load_geometry(assets: &AssetsConfig) -> Result<SceneGeometry> {
    match &assets.mesh {
        Some(path) => load_mesh(path),
        None => Ok(SceneGeometry::triangle()),
    }
}

/// Watches compiled shaders and reports when any of them changed
pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
    dir: PathBuf,
}

impl ShaderWatcher {
    pub fn new(dir: &Path) -> Result<Self> {
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            // Receiver gone means we are shutting down
            let _ = tx.send(res);
        })
        .context("Failed to create shader watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch shader directory {:?}", dir))?;
        log::info!("Watching {:?} for shader changes", dir);

        Ok(Self {
            _watcher: watcher,
            events,
            dir: dir.to_path_buf(),
        })
    }

    /// Drain pending events; true if a `.spv` file was written or replaced
    pub fn take_changed(&self) -> bool {
        let mut changed = false;
        while let Ok(res) = self.events.try_recv() {
            match res {
                Ok(event) => changed |= is_shader_change(&event),
                Err(e) => log::warn!("Shader watcher error in {:?}: {}", self.dir, e),
            }
        }
        changed
    }
}

fn is_shader_change(event: &notify::Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.extension().is_some_and(|ext| ext == "spv"))
}
