//! Loaders for precomputed boundary inputs.
//!
//! A precomputation step may supply a signed-distance field and per-voxel
//! surface labels as a `*.sdf.json` manifest with companion binary blobs,
//! plus a `*.dif.json` file mapping labels to absorption/scattering. When
//! present, the mesh builder prefers these for boundary labelling.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::geom::Vec3;
use crate::scene::{Bands, Surface, NUM_BANDS};

/// `*.sdf.json` manifest describing the companion binary blobs.
#[derive(Debug, Clone, Deserialize)]
pub struct SdfManifest {
    /// Number of grid nodes covered by the blobs.
    pub node_count: usize,
    /// Path (relative to the manifest) of the f32 signed distances.
    pub sdf_file: String,
    /// Path of the f32 x/y/z interleaved unit normals.
    pub normals_file: String,
    /// Path of the i16 per-node surface labels.
    pub labels_file: String,
}

/// Precomputed boundary state: distances, normals and labels per grid node.
#[derive(Debug, Clone)]
pub struct PrecomputedBoundary {
    pub sdf: Vec<f32>,
    pub normals: Vec<Vec3>,
    pub labels: Vec<i16>,
}

/// One entry of a `*.dif.json` label table.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelSurface {
    pub label: i16,
    pub absorption: Vec<f32>,
    pub scattering: Vec<f32>,
}

fn input_error(path: &Path, message: impl ToString) -> EngineError {
    EngineError::PrecomputedInput {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

fn read_f32_blob(path: &Path, expected: usize) -> Result<Vec<f32>> {
    let bytes = fs::read(path).map_err(|e| input_error(path, e))?;
    if bytes.len() != expected * 4 {
        return Err(input_error(
            path,
            format!("expected {} bytes, found {}", expected * 4, bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_i16_blob(path: &Path, expected: usize) -> Result<Vec<i16>> {
    let bytes = fs::read(path).map_err(|e| input_error(path, e))?;
    if bytes.len() != expected * 2 {
        return Err(input_error(
            path,
            format!("expected {} bytes, found {}", expected * 2, bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Loads the signed-distance field, normals and labels named by a manifest.
pub fn load_precomputed_boundary(manifest_path: &Path) -> Result<PrecomputedBoundary> {
    let text = fs::read_to_string(manifest_path).map_err(|e| input_error(manifest_path, e))?;
    let manifest: SdfManifest =
        serde_json::from_str(&text).map_err(|e| input_error(manifest_path, e))?;

    let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let sdf = read_f32_blob(&dir.join(&manifest.sdf_file), manifest.node_count)?;
    let raw_normals = read_f32_blob(&dir.join(&manifest.normals_file), manifest.node_count * 3)?;
    let labels = read_i16_blob(&dir.join(&manifest.labels_file), manifest.node_count)?;

    let normals = raw_normals
        .chunks_exact(3)
        .map(|c| Vec3::new(c[0], c[1], c[2]))
        .collect();

    Ok(PrecomputedBoundary {
        sdf,
        normals,
        labels,
    })
}

/// Loads a `*.dif.json` label table into a label -> surface map.
pub fn load_label_surfaces(path: &Path) -> Result<HashMap<i16, Surface>> {
    let text = fs::read_to_string(path).map_err(|e| input_error(path, e))?;
    let entries: Vec<LabelSurface> =
        serde_json::from_str(&text).map_err(|e| input_error(path, e))?;

    let mut map = HashMap::with_capacity(entries.len());
    for entry in entries {
        let to_bands = |values: &[f32]| -> Result<Bands> {
            if values.len() != NUM_BANDS {
                return Err(input_error(
                    path,
                    format!(
                        "label {} carries {} band values, expected {NUM_BANDS}",
                        entry.label,
                        values.len()
                    ),
                ));
            }
            let mut bands = [0.0; NUM_BANDS];
            bands.copy_from_slice(values);
            Ok(bands)
        };
        let surface = Surface::new(to_bands(&entry.absorption)?, to_bands(&entry.scattering)?);
        map.insert(entry.label, surface);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_precomputed_boundary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let n = 4;

        let sdf: Vec<f32> = vec![-0.1, 0.2, -0.3, 0.4];
        let normals: Vec<f32> = (0..n * 3).map(|i| i as f32).collect();
        let labels: Vec<i16> = vec![0, 1, 1, 2];

        let write = |name: &str, bytes: Vec<u8>| {
            let mut f = fs::File::create(dir.path().join(name)).unwrap();
            f.write_all(&bytes).unwrap();
        };
        write(
            "room.sdf.bin",
            sdf.iter().flat_map(|v| v.to_le_bytes()).collect(),
        );
        write(
            "room.normals.bin",
            normals.iter().flat_map(|v| v.to_le_bytes()).collect(),
        );
        write(
            "room.labels.bin",
            labels.iter().flat_map(|v| v.to_le_bytes()).collect(),
        );

        let manifest = dir.path().join("room.sdf.json");
        fs::write(
            &manifest,
            r#"{"node_count": 4, "sdf_file": "room.sdf.bin",
               "normals_file": "room.normals.bin", "labels_file": "room.labels.bin"}"#,
        )
        .unwrap();

        let loaded = load_precomputed_boundary(&manifest).unwrap();
        assert_eq!(loaded.sdf, sdf);
        assert_eq!(loaded.labels, labels);
        assert_eq!(loaded.normals.len(), 4);
        assert_eq!(loaded.normals[1], Vec3::new(3.0, 4.0, 5.0));
    }

    #[test]
    fn test_size_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("short.bin"), [0u8; 6]).unwrap();
        fs::write(dir.path().join("n.bin"), [0u8; 48]).unwrap();
        fs::write(dir.path().join("l.bin"), [0u8; 8]).unwrap();
        let manifest = dir.path().join("room.sdf.json");
        fs::write(
            &manifest,
            r#"{"node_count": 4, "sdf_file": "short.bin",
               "normals_file": "n.bin", "labels_file": "l.bin"}"#,
        )
        .unwrap();

        let err = load_precomputed_boundary(&manifest).unwrap_err();
        assert_eq!(err.kind(), "io/precomputed_input");
    }

    #[test]
    fn test_load_label_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room.dif.json");
        fs::write(
            &path,
            r#"[{"label": 3,
                 "absorption": [0.1, 0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.2],
                 "scattering": [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]}]"#,
        )
        .unwrap();

        let map = load_label_surfaces(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert!((map[&3].absorption[4] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_band_count_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.dif.json");
        fs::write(
            &path,
            r#"[{"label": 0, "absorption": [0.1, 0.2], "scattering": [0.0, 0.0]}]"#,
        )
        .unwrap();
        assert!(load_label_surfaces(&path).is_err());
    }
}
