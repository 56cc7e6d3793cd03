/// Pixel budget (width * height) an uploaded image may occupy before it is downscaled.
pub const MAX_IMAGE_PIXELS: u64 = 1024 * 1024;

pub const MAX_IMAGES_PER_DATASET: u64 = 500;

pub const MAX_CAPTIONS_PER_DATASET: u64 = 500;

/// Default width of the upload worker pool.
pub const UPLOAD_CONCURRENCY: usize = 3;

/// Upper bound on jobs returned by a dataset job listing.
pub const JOB_LIST_LIMIT: usize = 25;
