//! CIFAR-10 に対する VGG16 転移学習
//!
//! - `data`: CIFAR-10 バイナリ版の取得・パース・正規化・分割
//! - `ml`: モデル定義、学習ループ、評価、推論
//! - `model`: 設定ファイルと学習済みモデル (tar.gz) の永続化

pub mod data;
pub mod ml;
pub mod model;
