use crate::{common::*, model::params};

/// Decodes `[batch, joints, height, width]` heatmaps into `[batch, joints, 3]`
/// normalized `(x, y, confidence)` at the peak pixel centers.
pub fn heatmap_to_keypoints(heatmap: &Tensor) -> Fallible<Tensor> {
    let (batch_size, num_joints, height, width) = heatmap.size4()?;

    let (peaks, indexes) = heatmap
        .view([batch_size, num_joints, height * width])
        .max_dim(-1, false);
    let indexes = indexes.to_kind(Kind::Float);
    let rows = (&indexes / width as f64).floor();
    let cols = &indexes - &rows * width as f64;

    let xs = (cols + 0.5) / width as f64;
    let ys = (rows + 0.5) / height as f64;
    Ok(Tensor::stack(&[xs, ys, peaks.to_kind(Kind::Float)], 2))
}

/// Reshapes flat `[batch, 3 * joints]` predictions or targets into
/// `[batch, joints, 3]`.
pub fn joints_to_keypoints(joints: &Tensor) -> Fallible<Tensor> {
    let (batch_size, values) = joints.size2()?;
    ensure!(
        values % params::JOINT_DIMS == 0,
        "expect a multiple of {} values per sample, but get {}",
        params::JOINT_DIMS,
        values
    );
    Ok(joints.view([batch_size, values / params::JOINT_DIMS, params::JOINT_DIMS]))
}

/// Per-joint distances between predicted and target keypoints, both
/// `[batch, joints, 3]`, and the visibility mask of the targets.
fn distances(pred: &Tensor, target: &Tensor) -> Fallible<(Tensor, Tensor)> {
    ensure!(
        pred.size() == target.size(),
        "prediction shape {:?} does not match target shape {:?}",
        pred.size(),
        target.size()
    );
    let diff = pred.narrow(2, 0, 2) - target.narrow(2, 0, 2);
    let dist = (&diff * &diff)
        .sum_dim_intlist(&[2], false, Kind::Float)
        .sqrt();
    let mask = target.select(2, 2).gt(0.5).to_kind(Kind::Float);
    Ok((dist, mask))
}

/// Mean euclidean distance over visible joints, in normalized image units.
/// Returns `None` when no target joint is visible.
pub fn keypoint_error(pred: &Tensor, target: &Tensor) -> Fallible<Option<f64>> {
    let (dist, mask) = distances(pred, target)?;
    let visible = mask.sum(Kind::Float).double_value(&[]);
    if visible == 0.0 {
        return Ok(None);
    }
    let total = (dist * &mask).sum(Kind::Float).double_value(&[]);
    Ok(Some(total / visible))
}

/// Percentage of correct keypoints: the fraction of visible joints whose
/// prediction lies within `threshold` of the target.
pub fn pck(pred: &Tensor, target: &Tensor, threshold: f64) -> Fallible<Option<f64>> {
    let (dist, mask) = distances(pred, target)?;
    let visible = mask.sum(Kind::Float).double_value(&[]);
    if visible == 0.0 {
        return Ok(None);
    }
    let correct = (dist.le(threshold).to_kind(Kind::Float) * &mask)
        .sum(Kind::Float)
        .double_value(&[]);
    Ok(Some(correct / visible))
}
