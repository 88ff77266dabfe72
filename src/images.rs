use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{ExprecError, Result};
use crate::layout::{ensure_component, RunPaths};

/// Encodes `image` as PNG and stores it at `images/<name>/<step>.png`,
/// replacing only an image previously stored at the same step.
pub async fn save_image(paths: &RunPaths, name: &str, image: &DynamicImage, step: u64) -> Result<PathBuf> {
    ensure_component(name)?;
    let dir = paths.image_series(name);
    fs::create_dir_all(&dir).await?;

    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;

    let png = paths.image_at(name, step);
    let png_tmp = dir.join(format!("{step}.png.tmp"));
    {
        let mut f = fs::File::create(&png_tmp).await?;
        f.write_all(&bytes).await?;
        let _ = f.sync_all().await; // best-effort
    }
    fs::rename(&png_tmp, &png).await?;
    Ok(png)
}

/// Steps stored for an image series, ascending.
pub async fn image_steps(paths: &RunPaths, name: &str) -> Result<Vec<u64>> {
    ensure_component(name)?;
    let mut steps = Vec::new();
    let mut rd = match fs::read_dir(paths.image_series(name)).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(steps),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("png") { continue; }
        if let Some(step) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
            steps.push(step);
        }
    }
    steps.sort_unstable();
    Ok(steps)
}

/// Names of every image series in the run, sorted.
pub async fn image_names(paths: &RunPaths) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut rd = match fs::read_dir(paths.images()).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// The image at the highest stored step, with that step.
pub async fn latest_image(paths: &RunPaths, name: &str) -> Result<(u64, DynamicImage)> {
    let step = image_steps(paths, name)
        .await?
        .pop()
        .ok_or_else(|| ExprecError::not_found(format!("image series '{name}'")))?;
    let img = load_png(&paths.image_at(name, step)).await?;
    Ok((step, img))
}

async fn load_png(path: &Path) -> Result<DynamicImage> {
    let bytes = fs::read(path).await?;
    Ok(image::load_from_memory_with_format(&bytes, ImageFormat::Png)?)
}
