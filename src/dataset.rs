use crate::common::*;

/// One annotated image as stored in a label file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseLabel {
    /// Image path relative to the image directory.
    pub image: PathBuf,
    /// `(x, y, visibility)` per joint in source image pixels.
    pub points: Vec<[f32; 3]>,
}

#[derive(Debug, TensorLike)]
pub struct PoseBatch {
    /// `[batch, 3, size, size]` in `[0, 1]`.
    pub images: Tensor,
    /// `[batch, num_joints, size / 2, size / 2]`.
    pub heatmaps: Tensor,
    /// `[batch, 3 * num_joints]` normalized (x, y, visibility) triples.
    pub joints: Tensor,
}

/// Decoded sample in channel-first layout.
#[derive(Debug, Clone)]
struct PoseSample {
    image: Vec<f32>,
    heatmap: Vec<f32>,
    joints: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct PoseDatasetInit<'a> {
    pub label_file: &'a Path,
    pub image_dir: &'a Path,
    pub num_joints: usize,
    pub input_size: usize,
    pub heatmap_sigma: f64,
    pub flip_pairs: &'a [[usize; 2]],
}

impl<'a> PoseDatasetInit<'a> {
    pub fn build(self) -> Fallible<PoseDataset> {
        let Self {
            label_file,
            image_dir,
            num_joints,
            input_size,
            heatmap_sigma,
            flip_pairs,
        } = self;

        ensure!(
            input_size >= 2 && input_size % 2 == 0,
            "input_size must be even, but get {}",
            input_size
        );
        ensure!(
            flip_pairs
                .iter()
                .flatten()
                .all(|&joint| joint < num_joints),
            "flip pairs must refer to joints below {}",
            num_joints
        );

        let reader = BufReader::new(
            File::open(label_file)
                .with_context(|| format!("failed to open label file {}", label_file.display()))?,
        );
        let labels: Vec<PoseLabel> = serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse label file {}", label_file.display()))?;

        let labels = labels
            .into_iter()
            .enumerate()
            .map(|(index, label)| {
                ensure!(
                    label.points.len() == num_joints,
                    "label {} ({}) has {} points, but {} joints are expected",
                    index,
                    label.image.display(),
                    label.points.len(),
                    num_joints
                );
                Ok(PoseLabel {
                    image: image_dir.join(&label.image),
                    ..label
                })
            })
            .collect::<Fallible<Vec<_>>>()?;

        debug!(
            "loaded {} labels from {}",
            labels.len(),
            label_file.display()
        );

        Ok(PoseDataset {
            labels,
            num_joints,
            input_size,
            heatmap_sigma,
            flip_pairs: flip_pairs.to_vec(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PoseDataset {
    labels: Vec<PoseLabel>,
    num_joints: usize,
    input_size: usize,
    heatmap_sigma: f64,
    flip_pairs: Vec<[usize; 2]>,
}

impl PoseDataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn heatmap_size(&self) -> usize {
        self.input_size / 2
    }

    /// Plans one pass over the dataset. Shuffling and flip decisions are drawn
    /// up front; images are decoded lazily, one batch at a time.
    pub fn batches<R>(
        &self,
        batch_size: usize,
        shuffle: bool,
        augment: bool,
        rng: &mut R,
    ) -> Batches<'_>
    where
        R: Rng,
    {
        let mut indexes = (0..self.len()).collect_vec();
        if shuffle {
            indexes.shuffle(rng);
        }

        let items = indexes
            .into_iter()
            .map(|index| (index, augment && rng.gen_bool(0.5)))
            .collect_vec();
        let plan = items
            .chunks(batch_size.max(1))
            .map(<[_]>::to_vec)
            .collect_vec();

        Batches {
            dataset: self,
            plan: plan.into_iter(),
        }
    }

    pub fn load_batch(&self, items: &[(usize, bool)]) -> Fallible<PoseBatch> {
        ensure!(!items.is_empty(), "cannot load an empty batch");

        let samples = items
            .par_iter()
            .map(|&(index, flip)| self.load_sample(index, flip))
            .collect::<Fallible<Vec<_>>>()?;

        let batch_size = samples.len() as i64;
        let size = self.input_size as i64;
        let hm_size = self.heatmap_size() as i64;
        let num_joints = self.num_joints as i64;

        let concat = |select: fn(&PoseSample) -> &[f32]| {
            let values = samples
                .iter()
                .flat_map(|sample| select(sample).iter().copied())
                .collect_vec();
            Tensor::of_slice(&values)
        };

        let images = concat(|sample| sample.image.as_slice()).view([batch_size, 3, size, size]);
        let heatmaps =
            concat(|sample| sample.heatmap.as_slice()).view([batch_size, num_joints, hm_size, hm_size]);
        let joints = concat(|sample| sample.joints.as_slice()).view([batch_size, num_joints * 3]);

        Ok(PoseBatch {
            images,
            heatmaps,
            joints,
        })
    }

    fn load_sample(&self, index: usize, flip: bool) -> Fallible<PoseSample> {
        let label = &self.labels[index];
        let size = self.input_size as u32;

        let image = image::open(&label.image)
            .with_context(|| format!("failed to load image {}", label.image.display()))?;
        let (width, height) = image.dimensions();
        let image = image.resize_exact(size, size, FilterType::Triangle);
        let image = if flip { image.fliph() } else { image };

        let mut points = normalize_points(&label.points, width, height);
        if flip {
            flip_points(&mut points, &self.flip_pairs);
        }

        Ok(PoseSample {
            image: image_to_chw(&image.to_rgb8()),
            heatmap: render_heatmaps(&points, self.heatmap_size(), self.heatmap_sigma),
            joints: points.iter().flatten().copied().collect(),
        })
    }
}

pub struct Batches<'a> {
    dataset: &'a PoseDataset,
    plan: std::vec::IntoIter<Vec<(usize, bool)>>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Fallible<PoseBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let items = self.plan.next()?;
        Some(self.dataset.load_batch(&items))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.plan.size_hint()
    }
}

/// Scales pixel coordinates to `[0, 1]`. Invisible points and points outside
/// the image become `(0, 0, 0)`.
pub fn normalize_points(points: &[[f32; 3]], width: u32, height: u32) -> Vec<[f32; 3]> {
    points
        .iter()
        .map(|&[x, y, visibility]| {
            let x = x / width as f32;
            let y = y / height as f32;
            let inside = (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y);
            if visibility > 0.0 && inside {
                [x, y, 1.0]
            } else {
                [0.0, 0.0, 0.0]
            }
        })
        .collect()
}

/// Mirrors normalized points horizontally and swaps left/right joints.
pub fn flip_points(points: &mut [[f32; 3]], flip_pairs: &[[usize; 2]]) {
    points
        .iter_mut()
        .filter(|point| point[2] > 0.0)
        .for_each(|point| point[0] = 1.0 - point[0]);
    flip_pairs
        .iter()
        .for_each(|&[lhs, rhs]| points.swap(lhs, rhs));
}

/// Renders one gaussian peak per visible joint, sampled at pixel centers.
/// Output layout is `[num_joints, size, size]`.
pub fn render_heatmaps(points: &[[f32; 3]], size: usize, sigma: f64) -> Vec<f32> {
    let mut heatmaps = vec![0f32; points.len() * size * size];
    let denom = 2.0 * sigma * sigma;

    points
        .iter()
        .zip(heatmaps.chunks_mut(size * size))
        .filter(|([_, _, visibility], _)| *visibility > 0.0)
        .for_each(|(&[x, y, _], heatmap)| {
            let cx = x as f64 * size as f64;
            let cy = y as f64 * size as f64;

            heatmap
                .iter_mut()
                .enumerate()
                .for_each(|(offset, value)| {
                    let px = (offset % size) as f64 + 0.5;
                    let py = (offset / size) as f64 + 0.5;
                    let dist2 = (px - cx).powi(2) + (py - cy).powi(2);
                    *value = (-dist2 / denom).exp() as f32;
                });
        });

    heatmaps
}

fn image_to_chw(image: &RgbImage) -> Vec<f32> {
    let raw = image.as_raw();
    (0..3)
        .flat_map(|channel| {
            raw.iter()
                .skip(channel)
                .step_by(3)
                .map(|&value| value as f32 / 255.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "blazepose-dataset-{}-{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_dataset(dir: &Path, count: usize) -> PathBuf {
        let labels = (0..count)
            .map(|index| {
                let file = format!("{}.png", index);
                let mut image = RgbImage::new(64, 32);
                image.put_pixel(0, 0, Rgb([255, 0, 0]));
                image.save(dir.join(&file)).unwrap();
                PoseLabel {
                    image: file.into(),
                    points: vec![[16.0, 8.0, 1.0], [48.0, 24.0, 1.0], [10.0, 10.0, 0.0]],
                }
            })
            .collect_vec();

        let label_file = dir.join("labels.json");
        fs::write(&label_file, serde_json::to_string(&labels).unwrap()).unwrap();
        label_file
    }

    #[test]
    fn normalizes_and_masks_points() {
        let points = normalize_points(
            &[[32.0, 16.0, 1.0], [10.0, 10.0, 0.0], [80.0, 10.0, 1.0]],
            64,
            32,
        );
        assert_eq!(points, vec![[0.5, 0.5, 1.0], [0.0; 3], [0.0; 3]]);
    }

    #[test]
    fn flipping_mirrors_visible_points_and_swaps_pairs() {
        let mut points = vec![[0.25, 0.5, 1.0], [0.75, 0.1, 1.0], [0.0, 0.0, 0.0]];
        flip_points(&mut points, &[[0, 1]]);
        assert_eq!(points, vec![[0.25, 0.1, 1.0], [0.75, 0.5, 1.0], [0.0, 0.0, 0.0]]);
    }

    #[test]
    fn heatmap_peaks_at_joint() {
        let size = 16;
        let heatmaps = render_heatmaps(&[[0.25, 0.75, 1.0], [0.5, 0.5, 0.0]], size, 1.0);
        assert_eq!(heatmaps.len(), 2 * size * size);

        let (first, second) = heatmaps.split_at(size * size);
        let (argmax, peak) = first
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (offset, value)| {
                if value > best.1 {
                    (offset, value)
                } else {
                    best
                }
            });
        // joint at (4.0, 12.0) lies on the corner shared by four pixels
        assert!([(3, 11), (4, 11), (3, 12), (4, 12)].contains(&(argmax % size, argmax / size)));
        assert!(peak > 0.7 && peak <= 1.0);
        assert!(second.iter().all(|&value| value == 0.0));
    }

    #[test]
    fn image_conversion_is_channel_first() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 51]));
        image.put_pixel(1, 0, Rgb([0, 255, 0]));
        let values = image_to_chw(&image);
        assert_eq!(values, vec![1.0, 0.0, 0.0, 1.0, 0.2, 0.0]);
    }

    #[test]
    fn loads_batches_from_label_file() {
        let dir = temp_dir("batches");
        let label_file = write_dataset(&dir, 5);

        let dataset = PoseDatasetInit {
            label_file: &label_file,
            image_dir: &dir,
            num_joints: 3,
            input_size: 32,
            heatmap_sigma: 1.0,
            flip_pairs: &[[0, 1]],
        }
        .build()
        .unwrap();
        assert_eq!(dataset.len(), 5);

        let mut rng = StdRng::seed_from_u64(7);
        let batches: Vec<_> = dataset
            .batches(2, true, false, &mut rng)
            .collect::<Fallible<_>>()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].images.size(), vec![2, 3, 32, 32]);
        assert_eq!(batches[0].heatmaps.size(), vec![2, 3, 16, 16]);
        assert_eq!(batches[2].joints.size(), vec![1, 9]);

        let joints = Vec::<f32>::from(&batches[2].joints.view([-1]));
        assert_eq!(joints, vec![0.25, 0.25, 1.0, 0.75, 0.75, 1.0, 0.0, 0.0, 0.0]);

        let flipped = dataset.load_batch(&[(0, true)]).unwrap();
        let joints = Vec::<f32>::from(&flipped.joints.view([-1]));
        assert_eq!(joints, vec![0.25, 0.75, 1.0, 0.75, 0.25, 1.0, 0.0, 0.0, 0.0]);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_labels_with_wrong_joint_count() {
        let dir = temp_dir("joint-count");
        let label_file = write_dataset(&dir, 1);

        let result = PoseDatasetInit {
            label_file: &label_file,
            image_dir: &dir,
            num_joints: 4,
            input_size: 32,
            heatmap_sigma: 1.0,
            flip_pairs: &[],
        }
        .build();
        assert!(result.is_err());

        fs::remove_dir_all(&dir).ok();
    }
}
