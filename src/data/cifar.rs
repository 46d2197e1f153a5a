//! CIFAR-10 データセットの読み込み
//!
//! 公開されているバイナリ版 (`cifar-10-binary.tar.gz`) を扱います。
//!
//! ## レコード形式
//! - 1バイト: ラベル (0-9)
//! - 3072バイト: 32x32 RGB画像 (R 1024, G 1024, B 1024 の順、各チャネル行優先)
//!
//! チャネル優先 (C, H, W) でそのまま並んでいるため、テンソル化の際に並べ替えは不要です。

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use burn::data::dataset::Dataset;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tracing::{debug, info};

use super::error::{DatasetError, Result};

/// 画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 32;

/// チャネル数
pub const NUM_CHANNELS: usize = 3;

/// 1画像あたりの画素数 (3 * 32 * 32)
pub const PIXELS_PER_IMAGE: usize = NUM_CHANNELS * IMAGE_SIZE * IMAGE_SIZE;

/// 1レコードのバイト数（ラベル + 画素）
pub const RECORD_LEN: usize = 1 + PIXELS_PER_IMAGE;

/// クラス数
pub const NUM_CLASSES: usize = 10;

/// クラス名（ラベル順）
pub const CIFAR10_CLASSES: [&str; NUM_CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// バイナリ版アーカイブの配布URL
pub const CIFAR10_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";

/// アーカイブ展開後のディレクトリ名
pub const BATCH_DIR: &str = "cifar-10-batches-bin";

/// 学習用バッチファイル
pub const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];

/// テスト用バッチファイル
pub const TEST_FILE: &str = "test_batch.bin";

/// 画素値の正規化方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Normalization {
    /// 0-255 を [0, 1] に線形変換
    #[default]
    UnitRange,
    /// [0, 1] に変換後、ImageNetの平均と標準偏差で標準化
    ImageNet,
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Normalization::UnitRange => write!(f, "unit-range [0, 1]"),
            Normalization::ImageNet => write!(f, "ImageNet mean/std"),
        }
    }
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 画素列 (C, H, W) を正規化して f32 に変換
pub fn normalize(pixels: &[u8], mode: Normalization) -> Vec<f32> {
    let plane = pixels.len() / NUM_CHANNELS;

    pixels
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let value = p as f32 / 255.0;
            match mode {
                Normalization::UnitRange => value,
                Normalization::ImageNet => {
                    let channel = (i / plane.max(1)).min(NUM_CHANNELS - 1);
                    (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]
                }
            }
        })
        .collect()
}

/// ラベルをone-hotベクトルに変換
pub fn one_hot(label: usize, num_classes: usize) -> Result<Vec<f32>> {
    if label >= num_classes {
        return Err(DatasetError::LabelOutOfRange { label, num_classes });
    }
    let mut encoded = vec![0.0f32; num_classes];
    encoded[label] = 1.0;
    Ok(encoded)
}

/// ラベルからクラス名を取得
pub fn class_name(label: usize) -> Option<&'static str> {
    CIFAR10_CLASSES.get(label).copied()
}

/// 1枚分の画像とラベル
///
/// 画素数は常に 3072、ラベルは常に 0..10 の範囲に収まる。
#[derive(Clone, Debug, PartialEq)]
pub struct CifarImage {
    /// 画素 (C, H, W) の順で平坦化
    pixels: Vec<u8>,
    label: u8,
}

impl CifarImage {
    /// 画素数とラベルを検査して作成
    pub fn new(pixels: Vec<u8>, label: u8) -> Result<Self> {
        if pixels.len() != PIXELS_PER_IMAGE {
            return Err(DatasetError::InvalidImage {
                len: pixels.len(),
                expected: PIXELS_PER_IMAGE,
            });
        }
        if label as usize >= NUM_CLASSES {
            return Err(DatasetError::LabelOutOfRange {
                label: label as usize,
                num_classes: NUM_CLASSES,
            });
        }
        Ok(Self { pixels, label })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn label(&self) -> u8 {
        self.label
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// バッチファイルの中身をレコードに分解
pub fn parse_batch(file: &str, bytes: &[u8]) -> Result<Vec<CifarImage>> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(DatasetError::TruncatedBatch {
            file: file.to_string(),
            len: bytes.len(),
            record_len: RECORD_LEN,
        });
    }

    bytes
        .chunks_exact(RECORD_LEN)
        .map(|record| CifarImage::new(record[1..].to_vec(), record[0]))
        .collect()
}

/// 画像をレコード形式のバイト列に戻す（テストデータ作成・キャッシュ用）
pub fn encode_batch(images: &[CifarImage]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(images.len() * RECORD_LEN);
    for image in images {
        bytes.push(image.label);
        bytes.extend_from_slice(&image.pixels);
    }
    bytes
}

fn read_batch_file(dir: &Path, name: &str) -> Result<Vec<CifarImage>> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(DatasetError::MissingFile(path.display().to_string()));
    }
    let bytes = std::fs::read(&path)?;
    let images = parse_batch(name, &bytes)?;
    debug!("{}: {} records", path.display(), images.len());
    Ok(images)
}

/// CIFAR-10 のサブセット
///
/// 画像本体は `Arc` で共有し、インデックスのリストだけを分割します。
#[derive(Clone, Debug)]
pub struct CifarDataset {
    images: Arc<Vec<CifarImage>>,
    indices: Vec<usize>,
}

impl CifarDataset {
    /// 画像リストからデータセットを作成
    pub fn from_images(images: Vec<CifarImage>) -> Self {
        let indices = (0..images.len()).collect();
        Self {
            images: Arc::new(images),
            indices,
        }
    }

    pub(crate) fn with_indices(&self, indices: Vec<usize>) -> Self {
        Self {
            images: Arc::clone(&self.images),
            indices,
        }
    }

    /// 学習用バッチ (data_batch_1..5) を読み込む
    pub fn load_train(batch_dir: &Path) -> Result<Self> {
        let mut images = Vec::new();
        for name in TRAIN_FILES {
            images.extend(read_batch_file(batch_dir, name)?);
        }
        info!("学習用データを読み込みました: {} 枚", images.len());
        Ok(Self::from_images(images))
    }

    /// テスト用バッチ (test_batch) を読み込む
    pub fn load_test(batch_dir: &Path) -> Result<Self> {
        let images = read_batch_file(batch_dir, TEST_FILE)?;
        info!("テスト用データを読み込みました: {} 枚", images.len());
        Ok(Self::from_images(images))
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0usize; NUM_CLASSES];
        for &idx in &self.indices {
            counts[self.images[idx].label as usize] += 1;
        }
        counts
    }
}

impl Dataset<CifarImage> for CifarDataset {
    fn get(&self, index: usize) -> Option<CifarImage> {
        let actual_index = *self.indices.get(index)?;
        self.images.get(actual_index).cloned()
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// tar.gz アーカイブを展開
pub fn extract_archive<R: Read>(reader: R, dest: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;
    let mut archive = Archive::new(GzDecoder::new(reader));
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to unpack archive into {}", dest.display()))?;
    Ok(())
}

/// ローカルのアーカイブファイルを展開
pub fn extract_archive_file(archive_path: &Path, dest: &Path) -> anyhow::Result<PathBuf> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;
    extract_archive(file, dest)?;
    verify_batch_dir(&dest.join(BATCH_DIR))?;
    Ok(dest.join(BATCH_DIR))
}

/// 展開済みディレクトリに必要なファイルが揃っているか確認
pub fn verify_batch_dir(batch_dir: &Path) -> Result<()> {
    for name in TRAIN_FILES.iter().chain(std::iter::once(&TEST_FILE)) {
        let path = batch_dir.join(name);
        if !path.is_file() {
            return Err(DatasetError::MissingFile(path.display().to_string()));
        }
    }
    Ok(())
}

/// データディレクトリにCIFAR-10が無ければダウンロードして展開
///
/// 戻り値はバッチファイルが置かれたディレクトリ。
pub fn ensure_downloaded(data_dir: &Path, allow_download: bool) -> anyhow::Result<PathBuf> {
    let batch_dir = data_dir.join(BATCH_DIR);
    if verify_batch_dir(&batch_dir).is_ok() {
        debug!("CIFAR-10 は展開済みです: {}", batch_dir.display());
        return Ok(batch_dir);
    }

    let local_archive = data_dir.join("cifar-10-binary.tar.gz");
    if local_archive.is_file() {
        info!("ローカルのアーカイブを展開します: {}", local_archive.display());
        return extract_archive_file(&local_archive, data_dir);
    }

    if !allow_download {
        anyhow::bail!(
            "CIFAR-10 が見つかりません: {} (fetch コマンドでダウンロードしてください)",
            batch_dir.display()
        );
    }

    info!("CIFAR-10 をダウンロードします: {}", CIFAR10_URL);
    let bytes = burn::data::network::downloader::download_file_as_bytes(
        CIFAR10_URL,
        "cifar-10-binary.tar.gz",
    );
    if bytes.is_empty() {
        return Err(DatasetError::InvalidArchive("downloaded archive is empty".to_string()).into());
    }
    info!(
        "ダウンロード完了: {:.2} MB",
        bytes.len() as f64 / 1024.0 / 1024.0
    );

    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&local_archive, &bytes)
        .with_context(|| format!("Failed to write archive: {}", local_archive.display()))?;
    extract_archive(bytes.as_slice(), data_dir)?;
    verify_batch_dir(&batch_dir)?;

    Ok(batch_dir)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// ラベルと画素値が一定のダミー画像
    pub(crate) fn solid_image(label: u8, value: u8) -> CifarImage {
        CifarImage::new(vec![value; PIXELS_PER_IMAGE], label).unwrap()
    }

    #[test]
    fn parse_batch_reads_records() {
        let images = vec![solid_image(3, 10), solid_image(9, 200)];
        let bytes = encode_batch(&images);
        assert_eq!(bytes.len(), 2 * RECORD_LEN);

        let parsed = parse_batch("test", &bytes).unwrap();
        assert_eq!(parsed, images);
    }

    #[test]
    fn parse_batch_rejects_truncated_input() {
        let mut bytes = encode_batch(&[solid_image(1, 1)]);
        bytes.pop();
        let err = parse_batch("short.bin", &bytes).unwrap_err();
        assert!(matches!(err, DatasetError::TruncatedBatch { .. }));
    }

    #[test]
    fn parse_batch_rejects_bad_label() {
        let mut bytes = vec![10u8];
        bytes.extend(vec![0u8; PIXELS_PER_IMAGE]);
        let err = parse_batch("bad.bin", &bytes).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::LabelOutOfRange { label: 10, .. }
        ));
    }

    #[test]
    fn image_rejects_wrong_pixel_count() {
        let err = CifarImage::new(vec![0u8; 10], 0).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::InvalidImage { len: 10, expected: PIXELS_PER_IMAGE }
        ));
        assert!(CifarImage::new(vec![0u8; PIXELS_PER_IMAGE + 1], 0).is_err());
    }

    #[test]
    fn image_rejects_label_outside_classes() {
        let err = CifarImage::new(vec![0u8; PIXELS_PER_IMAGE], 12).unwrap_err();
        assert!(matches!(err, DatasetError::LabelOutOfRange { label: 12, .. }));

        let image = CifarImage::new(vec![7u8; PIXELS_PER_IMAGE], 9).unwrap();
        assert_eq!(image.label(), 9);
        assert_eq!(image.pixels().len(), PIXELS_PER_IMAGE);
    }

    #[test]
    fn normalize_unit_range_bounds() {
        let pixels: Vec<u8> = (0..PIXELS_PER_IMAGE).map(|i| (i % 256) as u8).collect();
        let values = normalize(&pixels, Normalization::UnitRange);
        assert_eq!(values.len(), PIXELS_PER_IMAGE);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(values[0], 0.0);
        assert_eq!(values[255], 1.0);
    }

    #[test]
    fn normalize_imagenet_uses_per_channel_stats() {
        let pixels = vec![0u8; PIXELS_PER_IMAGE];
        let values = normalize(&pixels, Normalization::ImageNet);
        let plane = IMAGE_SIZE * IMAGE_SIZE;
        assert!((values[0] - (-0.485 / 0.229)).abs() < 1e-5);
        assert!((values[plane] - (-0.456 / 0.224)).abs() < 1e-5);
        assert!((values[2 * plane] - (-0.406 / 0.225)).abs() < 1e-5);
    }

    #[test]
    fn one_hot_has_single_hot_entry() {
        let encoded = one_hot(4, NUM_CLASSES).unwrap();
        assert_eq!(encoded.len(), NUM_CLASSES);
        assert_eq!(encoded.iter().filter(|&&v| v == 1.0).count(), 1);
        assert_eq!(encoded[4], 1.0);
        assert_eq!(encoded.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn one_hot_rejects_out_of_range() {
        assert!(one_hot(10, NUM_CLASSES).is_err());
    }

    #[test]
    fn class_names_follow_label_order() {
        assert_eq!(class_name(0), Some("airplane"));
        assert_eq!(class_name(9), Some("truck"));
        assert_eq!(class_name(10), None);
    }

    #[test]
    fn dataset_get_and_counts() {
        let dataset = CifarDataset::from_images(vec![
            solid_image(0, 0),
            solid_image(1, 1),
            solid_image(1, 2),
        ]);
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get(2).map(|img| img.pixels()[0]), Some(2));
        assert!(dataset.get(3).is_none());

        let counts = dataset.class_counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 2);
    }

    #[test]
    fn load_from_directory_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let batch_dir = dir.path().join(BATCH_DIR);
        std::fs::create_dir_all(&batch_dir).unwrap();
        for (i, name) in TRAIN_FILES.iter().enumerate() {
            let bytes = encode_batch(&[solid_image(i as u8, 1), solid_image(0, 2)]);
            std::fs::write(batch_dir.join(name), bytes).unwrap();
        }
        std::fs::write(batch_dir.join(TEST_FILE), encode_batch(&[solid_image(7, 3)])).unwrap();

        let train = CifarDataset::load_train(&batch_dir).unwrap();
        let test = CifarDataset::load_test(&batch_dir).unwrap();
        assert_eq!(train.len(), 10);
        assert_eq!(test.len(), 1);

        // ensure_downloaded は展開済みディレクトリをそのまま使う
        let resolved = ensure_downloaded(dir.path(), false).unwrap();
        assert_eq!(resolved, batch_dir);
    }

    #[test]
    fn missing_dataset_without_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_downloaded(dir.path(), false).is_err());
    }

    #[test]
    fn extract_archive_round_trip() {
        let src = tempfile::tempdir().unwrap();
        let batch_dir = src.path().join(BATCH_DIR);
        std::fs::create_dir_all(&batch_dir).unwrap();
        for name in TRAIN_FILES.iter().chain(std::iter::once(&TEST_FILE)) {
            std::fs::write(batch_dir.join(name), encode_batch(&[solid_image(2, 5)])).unwrap();
        }

        let archive_path = src.path().join("cifar-10-binary.tar.gz");
        {
            let file = File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(BATCH_DIR, &batch_dir).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tempfile::tempdir().unwrap();
        let extracted = extract_archive_file(&archive_path, dest.path()).unwrap();
        let test = CifarDataset::load_test(&extracted).unwrap();
        assert_eq!(test.get(0).map(|img| img.label()), Some(2));
    }
}
