use camino::{Utf8Path, Utf8PathBuf};

use crate::error::BratError;
use crate::fs_util::remove_if_exists;

pub const INPUTS_DIR: &str = "inputs";
pub const DEM_FILE: &str = "dem.tif";
pub const HILLSHADE_FILE: &str = "hillshade.tif";
pub const HYDROLOGY_FILE: &str = "hydrology.gpkg";
pub const BOUNDS_FILE: &str = "project_bounds.geojson";
pub const MANIFEST_FILE: &str = "project.rs.xml";

/// File locations inside one project directory. Manifest paths are stored
/// relative to the root, with forward slashes.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: Utf8PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn inputs_dir(&self) -> Utf8PathBuf {
        self.root.join(INPUTS_DIR)
    }

    pub fn dem_path(&self) -> Utf8PathBuf {
        self.inputs_dir().join(DEM_FILE)
    }

    pub fn hillshade_path(&self) -> Utf8PathBuf {
        self.inputs_dir().join(HILLSHADE_FILE)
    }

    pub fn hydrology_path(&self) -> Utf8PathBuf {
        self.inputs_dir().join(HYDROLOGY_FILE)
    }

    pub fn vector_path(&self, layer: &str) -> Utf8PathBuf {
        self.inputs_dir().join(format!("{layer}.gpkg"))
    }

    pub fn bounds_path(&self) -> Utf8PathBuf {
        self.root.join(BOUNDS_FILE)
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// `path` relative to the project root, as written into the manifest.
    pub fn relative(&self, path: &Utf8Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|component| component.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn ensure_inputs_dir(&self) -> Result<(), BratError> {
        std::fs::create_dir_all(self.inputs_dir().as_std_path())
            .map_err(|err| BratError::Filesystem(format!("{}: {err}", self.inputs_dir())))
    }

    /// Remove the manifest and fixed-name datasets of an earlier run, so a
    /// failed run never leaves a manifest describing files it did not write.
    pub fn clear_previous_run(&self) -> Result<(), BratError> {
        for path in [
            self.manifest_path(),
            self.dem_path(),
            self.hillshade_path(),
            self.hydrology_path(),
        ] {
            remove_if_exists(path.as_std_path())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = OutputLayout::new("out/kispiox");
        assert!(layout.dem_path().ends_with("inputs/dem.tif"));
        assert!(layout.vector_path("gba_railway_tracks_sp").ends_with("inputs/gba_railway_tracks_sp.gpkg"));
        assert_eq!(layout.relative(&layout.hydrology_path()), "inputs/hydrology.gpkg");
        assert_eq!(layout.relative(&layout.bounds_path()), "project_bounds.geojson");
    }

    #[test]
    fn clear_previous_run_keeps_unmanaged_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let layout = OutputLayout::new(root);
        layout.ensure_inputs_dir().unwrap();
        let rail = layout.vector_path("gba_railway_tracks_sp");
        for path in [layout.manifest_path(), layout.hydrology_path(), rail.clone()] {
            std::fs::write(path.as_std_path(), b"old").unwrap();
        }

        layout.clear_previous_run().unwrap();

        assert!(!layout.manifest_path().exists());
        assert!(!layout.hydrology_path().exists());
        assert!(rail.exists());
        layout.clear_previous_run().unwrap();
    }
}
