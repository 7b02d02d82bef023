use crate::{
    common::*,
    config::{Config, TrainerKind, TrainingConfig},
    dataset::{PoseDataset, PoseDatasetInit},
    loss::PoseObjective,
    metrics,
    model::{freeze_heatmap_path, BlazePose, BlazePoseInit, ModelPhase},
};

/// Summary of one pass over the validation set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    pub keypoint_error: Option<f64>,
    pub pck: Option<f64>,
}

/// One line of `metrics.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub step: i64,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub elapsed_secs: f64,
    pub validation: Option<Evaluation>,
}

/// Resolves the model builder and whether the heatmap path stays frozen.
pub fn model_init(config: &Config) -> (BlazePoseInit, bool) {
    let num_joints = config.model.num_joints.get() as i64;

    match config.trainer {
        TrainerKind::BlazePose => (BlazePoseInit::new(num_joints, config.model.model_type), false),
        TrainerKind::KeypointDetection => {
            let phase = config.model.phase;
            (
                BlazePoseInit::from_phase(num_joints, phase),
                phase == ModelPhase::Regression,
            )
        }
    }
}

/// Trains until all epochs finish or `shutdown` is raised, saving the model
/// file on exit.
pub fn train(config: &Config, shutdown: &AtomicBool) -> Fallible<()> {
    let Config {
        trainer,
        model: model_config,
        dataset: dataset_config,
        training,
        logging,
    } = config;
    let device = training.device;

    info!(
        "trainer {:?}, model type {:?}, phase {:?}, device {:?}",
        trainer, model_config.model_type, model_config.phase, device
    );

    // load datasets
    let load_dataset = |label_file: &Path| {
        PoseDatasetInit {
            label_file,
            image_dir: &dataset_config.image_dir,
            num_joints: model_config.num_joints.get(),
            input_size: model_config.input_size,
            heatmap_sigma: dataset_config.heatmap_sigma,
            flip_pairs: &dataset_config.flip_pairs,
        }
        .build()
    };
    let train_set = load_dataset(dataset_config.train_labels.as_path())?;
    ensure!(!train_set.is_empty(), "the training set is empty");
    let val_set = dataset_config
        .val_labels
        .as_deref()
        .map(load_dataset)
        .transpose()?;
    if let Some(val_set) = &val_set {
        ensure!(!val_set.is_empty(), "the validation set is empty");
    }
    info!(
        "{} training samples, {} validation samples",
        train_set.len(),
        val_set.as_ref().map(PoseDataset::len).unwrap_or(0)
    );

    // build model
    let (init, freeze) = model_init(config);
    let mut vs = VarStore::new(device);
    let (model, mut step_tensor) = {
        let root = vs.root();
        let model = init.build(&root);
        let step_tensor = step_counter(&root);
        (model, step_tensor)
    };
    info!(
        "built model with {} joints, model type {:?}",
        model.num_joints(),
        model.model_type()
    );

    // restore checkpoint
    let mut step: i64 = 0;
    if let Some(path) = &training.model_file {
        if path.is_file() {
            info!("load model file {}", path.display());
            vs.load(path)
                .with_context(|| format!("failed to load model file {}", path.display()))?;
            step = step_tensor.int64_value(&[]);
        }
    }
    if let Some(initial_step) = training.initial_step {
        step = initial_step;
    }

    if freeze {
        let count = freeze_heatmap_path(&vs);
        info!("froze {} variables on the heatmap path", count);
    }

    let mut optimizer = nn::Adam::default().build(&vs, training.learning_rate.at(step))?;
    let objective = PoseObjective::from(&training.loss);
    let mut rng = match training.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut metrics_writer = if logging.enabled {
        fs::create_dir_all(&logging.log_dir)?;
        let path = logging.log_dir.join("metrics.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Some(BufWriter::new(file))
    } else {
        None
    };

    let global_instant = Instant::now();

    'epochs: for epoch in 0..training.epochs {
        let epoch_instant = Instant::now();
        let mut loss_sum = 0.0;
        let mut num_steps = 0usize;

        let mut batches = train_set.batches(
            training.batch_size.get(),
            training.shuffle,
            dataset_config.random_flip,
            &mut rng,
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                warn!("stop training at step {}", step);
                break 'epochs;
            }
            let batch = match batches.next() {
                Some(batch) => batch,
                None => break,
            };

            let step_instant = Instant::now();
            let batch = batch?.to_device(device);

            let lr = training.learning_rate.at(step);
            optimizer.set_lr(lr);

            let output = model.forward_t(&batch.images, true)?;
            let losses = objective.compute(&output, &batch)?;
            optimizer.backward_step(&losses.total);

            let loss = losses.total.double_value(&[]);
            ensure!(
                loss.is_finite(),
                "loss becomes {} at step {}, abort training",
                loss,
                step
            );
            loss_sum += loss;
            num_steps += 1;

            if logging.log_steps > 0 && step % logging.log_steps as i64 == 0 {
                info!(
                    "epoch: {}\tstep: {}\tglobal_elapsed: {}s\tstep_elapsed: {}ms\tlr: {:.3e}\tloss: {:.6}\theatmap_loss: {}\tjoints_loss: {}",
                    epoch,
                    step,
                    global_instant.elapsed().as_secs(),
                    step_instant.elapsed().as_millis(),
                    lr,
                    loss,
                    format_loss(&losses.heatmap),
                    format_loss(&losses.joints),
                );
            }

            step += 1;

            if training.save_steps > 0 && step % training.save_steps as i64 == 0 {
                save_model(&vs, &mut step_tensor, training, step)?;
            }
        }

        let train_loss = if num_steps > 0 {
            loss_sum / num_steps as f64
        } else {
            0.0
        };

        let validation = match &val_set {
            Some(val_set) => evaluate(&model, val_set, &objective, training, shutdown)?,
            None => None,
        };

        match &validation {
            Some(Evaluation {
                loss,
                keypoint_error,
                pck,
            }) => info!(
                "epoch {} done\ttrain_loss: {:.6}\tval_loss: {:.6}\tval_error: {:?}\tval_pck: {:?}",
                epoch, train_loss, loss, keypoint_error, pck
            ),
            None => info!("epoch {} done\ttrain_loss: {:.6}", epoch, train_loss),
        }

        if let Some(writer) = &mut metrics_writer {
            let record = EpochRecord {
                epoch,
                step,
                learning_rate: training.learning_rate.at(step),
                train_loss,
                elapsed_secs: epoch_instant.elapsed().as_secs_f64(),
                validation,
            };
            serde_json::to_writer(&mut *writer, &record)?;
            writeln!(writer)?;
            writer.flush()?;
        }
    }

    save_model(&vs, &mut step_tensor, training, step)?;
    info!("training finished at step {}", step);

    Ok(())
}

/// Computes the validation loss and keypoint accuracy without tracking
/// gradients. Returns `None` when `shutdown` is raised before the pass ends.
pub fn evaluate(
    model: &BlazePose,
    dataset: &PoseDataset,
    objective: &PoseObjective,
    training: &TrainingConfig,
    shutdown: &AtomicBool,
) -> Fallible<Option<Evaluation>> {
    ensure!(!dataset.is_empty(), "cannot evaluate on an empty dataset");

    let device = training.device;
    let mut rng = StdRng::seed_from_u64(0);
    let mut batches = dataset.batches(training.batch_size.get(), false, false, &mut rng);

    let mut loss_sum = 0.0;
    let mut num_batches = 0usize;
    let mut preds = vec![];
    let mut targets = vec![];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            warn!("validation interrupted after {} batches", num_batches);
            return Ok(None);
        }
        let batch = match batches.next() {
            Some(batch) => batch?.to_device(device),
            None => break,
        };

        let (loss, pred) = tch::no_grad(|| -> Fallible<_> {
            let output = model.forward_t(&batch.images, false)?;
            let losses = objective.compute(&output, &batch)?;
            let pred = match (&output.joints, &output.heatmap) {
                (Some(joints), _) => metrics::joints_to_keypoints(joints)?,
                (None, Some(heatmap)) => metrics::heatmap_to_keypoints(heatmap)?,
                (None, None) => bail!("the model output contains neither heatmaps nor joints"),
            };
            Ok((losses.total.double_value(&[]), pred))
        })?;

        loss_sum += loss;
        num_batches += 1;
        preds.push(pred.to_device(Device::Cpu));
        targets.push(metrics::joints_to_keypoints(&batch.joints)?.to_device(Device::Cpu));
    }

    let pred = Tensor::cat(&preds, 0);
    let target = Tensor::cat(&targets, 0);

    Ok(Some(Evaluation {
        loss: loss_sum / num_batches as f64,
        keypoint_error: metrics::keypoint_error(&pred, &target)?,
        pck: metrics::pck(&pred, &target, training.pck_threshold)?,
    }))
}

/// Registers the persisted step counter. It is kept out of the optimizer.
fn step_counter(root: &nn::Path) -> Tensor {
    root.zeros_no_train("step", &[])
}

fn save_model(
    vs: &VarStore,
    step_tensor: &mut Tensor,
    training: &TrainingConfig,
    step: i64,
) -> Fallible<()> {
    let path = match &training.model_file {
        Some(path) => path,
        None => return Ok(()),
    };

    debug!("save model file {} at step {}", path.display(), step);
    tch::no_grad(|| {
        step_tensor.copy_(&Tensor::from(step));
    });
    vs.save(path)
        .with_context(|| format!("failed to save model file {}", path.display()))?;
    Ok(())
}

fn format_loss(loss: &Option<Tensor>) -> String {
    match loss {
        Some(loss) => format!("{:.6}", loss.double_value(&[])),
        None => "-".into(),
    }
}
