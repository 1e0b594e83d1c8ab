use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

use crate::domain::Extent;
use crate::elevation::ElevationSource;
use crate::error::BratError;
use crate::fs_util::replace_atomic;

const COMPRESSION: [&str; 4] = ["-co", "COMPRESS=DEFLATE", "-co", "TILED=YES"];

/// External raster processing. Outputs go to `dst`; `src` is only read.
pub trait RasterTool: Send + Sync {
    fn compress(&self, src: &Path, dst: &Path) -> Result<(), BratError>;
    fn hillshade(&self, src: &Path, dst: &Path, compress: bool) -> Result<(), BratError>;
    fn tool_info(&self) -> ToolInfo;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub gdal_translate: Option<String>,
    pub gdaldem: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RasterToolStatus {
    Ready,
    Missing { message: String },
}

#[derive(Clone)]
pub struct GdalRasterTool {
    gdal_translate: Option<PathBuf>,
    gdaldem: Option<PathBuf>,
}

impl Default for GdalRasterTool {
    fn default() -> Self {
        Self::new()
    }
}

impl GdalRasterTool {
    pub fn new() -> Self {
        Self {
            gdal_translate: find_in_path("gdal_translate"),
            gdaldem: find_in_path("gdaldem"),
        }
    }

    /// `gdal_translate` is only needed when the DEM is recompressed.
    pub fn tool_status(&self, compress: bool) -> RasterToolStatus {
        if self.gdaldem.is_none() {
            return RasterToolStatus::Missing {
                message: "missing gdaldem (GDAL utilities)".to_string(),
            };
        }
        if compress && self.gdal_translate.is_none() {
            return RasterToolStatus::Missing {
                message: "missing gdal_translate (GDAL utilities)".to_string(),
            };
        }
        RasterToolStatus::Ready
    }

    fn require(tool: &Option<PathBuf>, name: &str) -> Result<PathBuf, BratError> {
        tool.clone()
            .ok_or_else(|| BratError::MissingTool(name.to_string()))
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<(), BratError> {
        tracing::debug!(program = %program.display(), ?args, "running");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| BratError::RasterTool(format!("{}: {err}", program.display())))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed ({}): {}", output.status, program.display())
        } else {
            stderr
        };
        Err(BratError::RasterTool(message))
    }
}

impl RasterTool for GdalRasterTool {
    fn compress(&self, src: &Path, dst: &Path) -> Result<(), BratError> {
        let program = Self::require(&self.gdal_translate, "gdal_translate")?;
        let args = compress_args(src, dst);
        self.run_cmd(&program, &args)
    }

    fn hillshade(&self, src: &Path, dst: &Path, compress: bool) -> Result<(), BratError> {
        let program = Self::require(&self.gdaldem, "gdaldem")?;
        let args = hillshade_args(src, dst, compress);
        self.run_cmd(&program, &args)
    }

    fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            gdal_translate: self
                .gdal_translate
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
            gdaldem: self
                .gdaldem
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
        }
    }
}

pub fn compress_args(src: &Path, dst: &Path) -> Vec<String> {
    let mut args: Vec<String> = COMPRESSION.iter().map(|arg| arg.to_string()).collect();
    args.push(src.display().to_string());
    args.push(dst.display().to_string());
    args
}

pub fn hillshade_args(src: &Path, dst: &Path, compress: bool) -> Vec<String> {
    let mut args = vec![
        "hillshade".to_string(),
        src.display().to_string(),
        dst.display().to_string(),
    ];
    if compress {
        args.extend(COMPRESSION.iter().map(|arg| arg.to_string()));
    }
    args
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() { None } else { Some(stdout) }
}

pub struct RasterDeriver<'a, E: ElevationSource + ?Sized, R: RasterTool + ?Sized> {
    elevation: &'a E,
    tool: &'a R,
    compress: bool,
    resolution: f64,
}

impl<'a, E: ElevationSource + ?Sized, R: RasterTool + ?Sized> RasterDeriver<'a, E, R> {
    pub fn new(elevation: &'a E, tool: &'a R, compress: bool, resolution: f64) -> Self {
        Self {
            elevation,
            tool,
            compress,
            resolution,
        }
    }

    /// Fetch the DEM for `native_extent` to `dem`, recompressing it in place
    /// when enabled. On return `dem` holds the final elevation raster.
    pub fn fetch_dem(&self, native_extent: &Extent, dem: &Path) -> Result<(), BratError> {
        self.elevation.fetch_dem(native_extent, self.resolution, dem)?;
        if self.compress {
            replace_atomic(dem, |staged| self.tool.compress(dem, staged))?;
            tracing::info!(path = %dem.display(), "DEM recompressed");
        }
        Ok(())
    }

    /// Derive `hillshade` from the final `dem`. The output only appears once
    /// the tool has succeeded.
    pub fn derive_hillshade(&self, dem: &Path, hillshade: &Path) -> Result<(), BratError> {
        replace_atomic(hillshade, |staged| {
            self.tool.hillshade(dem, staged, self.compress)
        })?;
        tracing::info!(path = %hillshade.display(), "hillshade derived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::Crs;

    struct FlatDem;

    impl ElevationSource for FlatDem {
        fn fetch_dem(&self, _: &Extent, _: f64, destination: &Path) -> Result<(), BratError> {
            fs::write(destination, b"raw").map_err(|err| BratError::Filesystem(err.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingTool {
        fail_hillshade: bool,
        hillshade_input: Mutex<Option<Vec<u8>>>,
    }

    impl RasterTool for RecordingTool {
        fn compress(&self, src: &Path, dst: &Path) -> Result<(), BratError> {
            let mut content = fs::read(src).map_err(|err| BratError::Filesystem(err.to_string()))?;
            content.extend_from_slice(b"+deflate");
            fs::write(dst, content).map_err(|err| BratError::Filesystem(err.to_string()))
        }

        fn hillshade(&self, src: &Path, dst: &Path, _compress: bool) -> Result<(), BratError> {
            let content = fs::read(src).map_err(|err| BratError::Filesystem(err.to_string()))?;
            *self.hillshade_input.lock().unwrap() = Some(content);
            if self.fail_hillshade {
                fs::write(dst, b"partial").unwrap();
                return Err(BratError::RasterTool("exit status 1".to_string()));
            }
            fs::write(dst, b"shade").map_err(|err| BratError::Filesystem(err.to_string()))
        }

        fn tool_info(&self) -> ToolInfo {
            ToolInfo {
                gdal_translate: None,
                gdaldem: None,
            }
        }
    }

    fn extent() -> Extent {
        Extent::new(1_000_000.0, 500_000.0, 1_001_000.0, 501_000.0, Crs::BcAlbers)
    }

    #[test]
    fn hillshade_reads_recompressed_dem() {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("dem.tif");
        let hillshade = dir.path().join("hillshade.tif");
        let tool = RecordingTool::default();
        let deriver = RasterDeriver::new(&FlatDem, &tool, true, 25.0);
        deriver.fetch_dem(&extent(), &dem).unwrap();
        deriver.derive_hillshade(&dem, &hillshade).unwrap();
        assert_eq!(fs::read(&dem).unwrap(), b"raw+deflate");
        assert_eq!(
            tool.hillshade_input.lock().unwrap().as_deref(),
            Some(&b"raw+deflate"[..])
        );
        assert_eq!(fs::read(&hillshade).unwrap(), b"shade");
    }

    #[test]
    fn uncompressed_dem_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("dem.tif");
        let tool = RecordingTool::default();
        RasterDeriver::new(&FlatDem, &tool, false, 25.0)
            .fetch_dem(&extent(), &dem)
            .unwrap();
        assert_eq!(fs::read(&dem).unwrap(), b"raw");
    }

    #[test]
    fn failed_hillshade_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("dem.tif");
        let hillshade = dir.path().join("hillshade.tif");
        let tool = RecordingTool {
            fail_hillshade: true,
            ..RecordingTool::default()
        };
        let deriver = RasterDeriver::new(&FlatDem, &tool, false, 25.0);
        deriver.fetch_dem(&extent(), &dem).unwrap();
        let err = deriver.derive_hillshade(&dem, &hillshade).unwrap_err();
        assert_matches!(err, BratError::RasterTool(_));
        assert!(!hillshade.exists());
    }

    #[test]
    fn hillshade_args_carry_compression() {
        let args = hillshade_args(Path::new("dem.tif"), Path::new("hs.tif"), true);
        assert_eq!(&args[..3], ["hillshade", "dem.tif", "hs.tif"]);
        assert!(args.contains(&"COMPRESS=DEFLATE".to_string()));
        let plain = hillshade_args(Path::new("dem.tif"), Path::new("hs.tif"), false);
        assert_eq!(plain.len(), 3);
    }
}
