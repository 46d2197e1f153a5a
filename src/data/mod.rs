pub mod cifar;
pub mod error;
pub mod split;

pub use cifar::{
    class_name, ensure_downloaded, extract_archive_file, normalize, one_hot, CifarDataset,
    CifarImage, Normalization, CIFAR10_CLASSES, IMAGE_SIZE, NUM_CHANNELS, NUM_CLASSES,
};
pub use error::DatasetError;
pub use split::{split_indices, SplitRatio};
