/// Stops training once validation loss fails to improve by `min_delta` for `patience` epochs.
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    pub best_loss: f32,
    counter: usize,
    pub stopped: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: f32::INFINITY,
            counter: 0,
            stopped: false,
        }
    }

    /// Returns true when `current_loss` improves on the best loss seen so far.
    pub fn is_improvement(&self, current_loss: f32) -> bool {
        current_loss < self.best_loss - self.min_delta
    }

    pub fn should_stop(&mut self, current_loss: f32) -> bool {
        if self.stopped {
            return true;
        }

        if self.is_improvement(current_loss) {
            self.best_loss = current_loss;
            self.counter = 0;
            return false;
        }

        self.counter += 1;
        if self.counter >= self.patience {
            self.stopped = true;
            log::info!(
                "Early stopping triggered! No improvement for {} epochs",
                self.patience
            );
        }
        self.stopped
    }

    pub fn reset(&mut self) {
        self.best_loss = f32::INFINITY;
        self.counter = 0;
        self.stopped = false;
    }
}
