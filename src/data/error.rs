//! データセット読み込みのエラー型

use thiserror::Error;

/// CIFAR-10 の読み込み・展開で発生するエラー
#[derive(Debug, Error)]
pub enum DatasetError {
    /// バッチファイルの長さがレコード長の倍数ではない
    #[error("malformed batch file {file}: {len} bytes is not a multiple of {record_len}")]
    TruncatedBatch {
        file: String,
        len: usize,
        record_len: usize,
    },

    /// ラベルがクラス数の範囲外
    #[error("label {label} out of range (num_classes = {num_classes})")]
    LabelOutOfRange { label: usize, num_classes: usize },

    /// 画素数が 32x32x3 と一致しない
    #[error("image has {len} pixel bytes, expected {expected}")]
    InvalidImage { len: usize, expected: usize },

    /// 必要なバッチファイルが存在しない
    #[error("missing batch file: {0}")]
    MissingFile(String),

    /// アーカイブのサイズ・内容が想定と異なる
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// データセット操作の結果型
pub type Result<T> = std::result::Result<T, DatasetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_batch_message() {
        let err = DatasetError::TruncatedBatch {
            file: "data_batch_1.bin".to_string(),
            len: 10,
            record_len: 3073,
        };
        let msg = err.to_string();
        assert!(msg.contains("data_batch_1.bin"));
        assert!(msg.contains("3073"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DatasetError = io_err.into();
        assert!(matches!(err, DatasetError::Io(_)));
    }
}
