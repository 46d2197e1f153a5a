//! one-hot ターゲットに対するカテゴリカル交差エントロピー

use burn::tensor::{activation::log_softmax, backend::Backend, Tensor};

/// カテゴリカル交差エントロピー
///
/// - `logits`: [batch_size, num_classes]
/// - `one_hot`: [batch_size, num_classes]（各行の和が1）
/// - `smoothing`: ラベルスムージング係数（0.0で無効）
///
/// 戻り値はバッチ平均の損失 [1]。
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    one_hot: Tensor<B, 2>,
    smoothing: f32,
) -> Tensor<B, 1> {
    let [_, num_classes] = logits.dims();

    let targets = if smoothing > 0.0 {
        one_hot
            .mul_scalar(1.0 - smoothing)
            .add_scalar(smoothing / num_classes as f32)
    } else {
        one_hot
    };

    let log_probs = log_softmax(logits, 1);
    (targets * log_probs).sum_dim(1).neg().mean()
}
