//! End-to-end tests for the fold trainer

use tokio::sync::mpsc;

use candle_core::DType;
use candle_nn::{Init, VarMap};

use crate::training::checkpoints::{metadata_path, read_metadata, write_checkpoint, CheckpointMetadata};
use crate::training::optimizers::OneCycleScheduler;
use crate::training::{ClassifierTrainer, TrainingEvent, TrainingStatus};

use super::fixtures::TrainingFixture;
use super::test_utils::{create_test_device, create_test_model};

const SAMPLES_PER_CLASS: usize = 8;

fn trainer_for(fixture: &TrainingFixture) -> ClassifierTrainer {
    let model = create_test_model(&fixture.config);
    ClassifierTrainer::new(model, fixture.fold_data()).unwrap()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TrainingEvent>) -> Vec<TrainingEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn test_fit_runs_every_epoch() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = trainer_for(&fixture).with_event_monitoring(tx);
    let steps_per_epoch = trainer.steps_per_epoch();

    let result = trainer.fit().unwrap();

    assert_eq!(result.history.len(), 2);
    assert_eq!(result.total_steps, 2 * steps_per_epoch);
    assert_eq!(result.final_state.status, TrainingStatus::Completed);
    assert_eq!(result.final_state.skipped_steps, 0);
    assert!(result.final_state.loss_scale.is_none());
    for summary in &result.history {
        assert!(summary.valid_loss.is_finite());
        assert!((0.0..=1.0).contains(&summary.valid_metric));
    }

    let events = drain(&mut rx);
    let epochs = events
        .iter()
        .filter(|e| matches!(e, TrainingEvent::EpochStarted { .. }))
        .count();
    let steps = events
        .iter()
        .filter(|e| matches!(e, TrainingEvent::StepCompleted { .. }))
        .count();
    assert_eq!(epochs, 2);
    assert_eq!(steps, 2 * steps_per_epoch);
    assert!(events.iter().any(|e| matches!(e, TrainingEvent::SwaApplied { epochs: 1 })));
    assert!(matches!(
        events.last(),
        Some(TrainingEvent::TrainingCompleted { .. })
    ));
}

#[test]
fn test_fit_writes_checkpoints() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let mut trainer = trainer_for(&fixture);
    let steps_per_epoch = trainer.steps_per_epoch();
    let result = trainer.fit().unwrap();

    let best = result.best_checkpoint_path.unwrap();
    assert!(best.exists());
    assert!(metadata_path(&best).exists());
    let name = best.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("epoch="));
    assert!(name.contains("_valid_metric="));

    let checkpoint_dir = best.parent().unwrap();
    assert!(checkpoint_dir.ends_with("test/tiny_0"));
    let monitored = std::fs::read_dir(checkpoint_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.starts_with("epoch=") && name.ends_with(".safetensors")
        })
        .count();
    assert_eq!(monitored, 1, "only the best checkpoint is kept");

    let last = read_metadata(&result.last_checkpoint_path).unwrap();
    assert!(last.swa);
    assert_eq!(last.epoch, 1);
    assert_eq!(last.global_step, result.total_steps);
    // the one-cycle schedule stops where averaging starts (epoch 1)
    let scheduler = last.scheduler.unwrap();
    assert_eq!(scheduler.step_count, steps_per_epoch);
    assert_eq!(scheduler.total_steps, result.total_steps);
}

#[test]
fn test_fresh_run_ignores_earlier_best() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let run_dir = fixture.config.checkpoint.dir.join("test/tiny_0");
    std::fs::create_dir_all(&run_dir).unwrap();

    let stale = run_dir.join("epoch=9_valid_metric=1.000.safetensors");
    let vars = VarMap::new();
    vars.get((2,), "w", Init::Const(0.0), DType::F32, &create_test_device())
        .unwrap();
    let mut metadata = CheckpointMetadata::new(9, 90);
    metadata.metrics.insert("valid_metric".to_string(), 1.0);
    write_checkpoint(&vars, &stale, &metadata).unwrap();

    let mut trainer = trainer_for(&fixture);
    let result = trainer.fit().unwrap();

    let best = result.best_checkpoint_path.unwrap();
    assert_ne!(best, stale);
    assert!(best.exists());
    assert!(read_metadata(&best).unwrap().epoch < 2);
    let best_of_run = result
        .history
        .iter()
        .map(|summary| summary.valid_metric)
        .fold(f64::MIN, f64::max);
    assert_eq!(trainer.state().best_score, Some(best_of_run));
}

#[test]
fn test_learning_rate_held_while_averaging() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = trainer_for(&fixture).with_event_monitoring(tx);
    let steps_per_epoch = trainer.steps_per_epoch();
    trainer.fit().unwrap();

    let lrs: Vec<f64> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            TrainingEvent::StepCompleted { lr, .. } => Some(lr),
            _ => None,
        })
        .collect();
    assert_eq!(lrs.len(), 2 * steps_per_epoch);

    let training = &fixture.config.training;
    let schedule =
        OneCycleScheduler::new(training.learning_rate, 2, steps_per_epoch, training.scheduler.clone()).unwrap();
    for (step, lr) in lrs[..steps_per_epoch].iter().enumerate() {
        assert!((lr - schedule.lr_at(step)).abs() < 1e-12);
    }

    // averaging starts at epoch 1 and holds the rate reached there
    let held = schedule.lr_at(steps_per_epoch);
    for lr in &lrs[steps_per_epoch..] {
        assert!((lr - held).abs() < 1e-12, "lr {} moved from {}", lr, held);
    }
}

#[test]
fn test_fit_writes_run_logs() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let mut trainer = trainer_for(&fixture);
    let result = trainer.fit().unwrap();
    drop(trainer);

    let run_dir = fixture.root().join("runs/test/tiny/tiny_0");
    let hparams: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("hparams.json")).unwrap()).unwrap();
    assert_eq!(hparams["hparams"]["num_classes"], 3);
    assert_eq!(hparams["hparams"]["fold"], 0);

    let lines: Vec<serde_json::Value> = std::fs::read_to_string(run_dir.join("metrics.jsonl"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let epoch_records: Vec<&serde_json::Value> = lines
        .iter()
        .filter(|record| record["metrics"].get("valid_metric").is_some())
        .collect();
    assert_eq!(epoch_records.len(), 2);
    // log_every_n_steps is 1, so every step is recorded too
    assert_eq!(lines.len(), 2 + result.total_steps);
}

#[test]
fn test_validate_before_training() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let mut trainer = trainer_for(&fixture);
    let summary = trainer.validate().unwrap();

    assert_eq!(summary.samples, fixture.fold_data().valid.len());
    assert_eq!(trainer.state().status, TrainingStatus::NotStarted);
}

#[test]
fn test_resume_continues_after_checkpoint_epoch() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let mut config = fixture.config.clone();
    config.training.swa.enabled = false;

    let model = create_test_model(&config);
    let mut trainer = ClassifierTrainer::new(model, fixture.fold_data()).unwrap();
    let steps_per_epoch = trainer.steps_per_epoch();
    let first = trainer.fit().unwrap();
    drop(trainer);

    let best = first.best_checkpoint_path.unwrap();
    let resumed_epoch = read_metadata(&best).unwrap().epoch;

    config.training.resume_from = Some(best);
    let model = create_test_model(&config);
    let mut trainer = ClassifierTrainer::new(model, fixture.fold_data()).unwrap();
    let second = trainer.fit().unwrap();

    assert_eq!(second.history.len(), 2 - (resumed_epoch + 1));
    assert_eq!(second.total_steps, 2 * steps_per_epoch);
}

#[test]
fn test_resume_with_different_schedule_fails() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    let mut trainer = trainer_for(&fixture);
    let first = trainer.fit().unwrap();
    drop(trainer);

    let mut config = fixture.config.clone();
    config.training.n_epochs = 3;
    config.training.resume_from = Some(first.last_checkpoint_path);
    let model = create_test_model(&config);
    let mut trainer = ClassifierTrainer::new(model, fixture.fold_data()).unwrap();

    assert!(trainer.fit().is_err());
    assert!(matches!(trainer.state().status, TrainingStatus::Failed { .. }));
}

#[test]
fn test_from_config_uses_pretrained_directory() {
    let fixture = TrainingFixture::new(SAMPLES_PER_CLASS);
    fixture.write_pretrained_model(2);

    let trainer = ClassifierTrainer::from_config(&fixture.config, &create_test_device()).unwrap();
    assert_eq!(trainer.model().num_classes(), 3);
    assert!(trainer.steps_per_epoch() > 0);
}
