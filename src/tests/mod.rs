//! Pipeline tests against the in-memory adapters.

use std::io::Cursor;
use std::time::Duration;

use bytes::Bytes;

use crate::blob::memory::MemoryBlob;
use crate::relay::RelayConfig;
use crate::service::ImageService;
use crate::store::memory::MemoryMetadata;


pub(crate) fn png_image(width: u32, height: u32) -> Bytes {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("encode fixture image");
    Bytes::from(buf.into_inner())
}

pub(crate) fn fixture() -> (
    ImageService<MemoryMetadata, MemoryBlob>,
    MemoryMetadata,
    MemoryBlob,
) {
    let metadata = MemoryMetadata::new();
    let blob = MemoryBlob::new();
    let service = ImageService::new(metadata.clone(), blob.clone());
    (service, metadata, blob)
}

pub(crate) fn relay_config(batch_size: i64, max_retries: i32) -> RelayConfig {
    RelayConfig {
        poll_interval: Duration::from_millis(10),
        mark_failed_interval: Duration::from_millis(10),
        cleanup_interval: Duration::from_millis(10),
        process_batch_timeout: Duration::from_secs(5),
        claim_timeout: Duration::from_secs(300),
        retention: Duration::from_secs(7 * 24 * 3600),
        batch_size,
        max_retries,
    }
}
