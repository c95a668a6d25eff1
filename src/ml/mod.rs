// ============================================================
// Layer 5 — ML Layer
// ============================================================
// Blending, sliding-window inference, the step engine and
// everything that touches the Burn framework.
//
// Only model.rs, loss.rs (soft_dice_loss) and learner.rs import
// burn. blender.rs, inferencer.rs and trainer.rs work on
// ndarray volumes and the domain traits, so the orchestration
// core is testable with plain mock models.
//
// What's in this layer:
//
//   blender.rs    — Blend weight fields (constant / gaussian)
//                   and the weighted-sum accumulator
//
//   inferencer.rs — Patch origin tiling and the sliding-window
//                   ensemble + flip TTA engine
//
//   trainer.rs    — TrainingState counters and the StepEngine
//                   (train_step / val_step)
//
//   loss.rs       — Soft Dice loss on volumes and on tensors
//
//   model.rs      — Dilated residual 3D conv network
//
//   learner.rs    — Burn-backed Learner, LearnerFactory and
//                   inference predictor
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)

/// Blend weights and accumulator
pub mod blender;

/// Sliding-window inference engine
pub mod inferencer;

/// Burn learner factory, learner and predictor
pub mod learner;

/// Dice losses
pub mod loss;

/// 3D segmentation network
pub mod model;

/// Training step engine and per-fold counters
pub mod trainer;
