// SPDX-License-Identifier: MIT

//! Framework layer: the contracts the engine and its collaborators share
//!
//! - `Step` - the unit of work the executor schedules
//! - `ProgressEmitter` - optional listener for run progress
//! - typed errors for every boundary

pub mod error;
pub mod progress;
pub mod step;

pub use error::{ConditionError, ExecutorError, StateStoreError, StepGraphError, ValidationError};
pub use progress::{ChannelEmitter, LogEmitter, ProgressEmitter, ProgressError, ProgressEvent};
pub use step::{FnStep, Step, StepContext, StepError, StepSpec};
