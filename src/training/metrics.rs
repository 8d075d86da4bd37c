use crate::model::loss::LossBreakdown;

/// Running mean of the total loss and its unweighted terms over an epoch.
#[derive(Debug, Clone, Default)]
pub struct LossMeter {
    total: f32,
    terms: LossBreakdown,
    count: usize,
}

impl LossMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, total: f32, terms: LossBreakdown) {
        self.total += total;
        self.terms.xy += terms.xy;
        self.terms.wh += terms.wh;
        self.terms.obj += terms.obj;
        self.terms.noobj += terms.noobj;
        self.terms.class += terms.class;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean total loss, `None` before the first update.
    pub fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| self.total / self.count as f32)
    }

    /// Mean total loss of an epoch, `f32::INFINITY` when no batch finished.
    pub fn epoch_loss(&self, phase: &str) -> f32 {
        self.mean().unwrap_or_else(|| {
            log::warn!("No valid {} batches!", phase);
            f32::INFINITY
        })
    }

    pub fn mean_terms(&self) -> LossBreakdown {
        let n = self.count.max(1) as f32;
        LossBreakdown {
            xy: self.terms.xy / n,
            wh: self.terms.wh / n,
            obj: self.terms.obj / n,
            noobj: self.terms.noobj / n,
            class: self.terms.class / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut meter = LossMeter::new();
        assert_eq!(meter.mean(), None);

        let terms = |v: f32| LossBreakdown {
            xy: v,
            wh: 2.0 * v,
            obj: 0.0,
            noobj: v,
            class: 0.5,
        };
        meter.update(1.0, terms(1.0));
        meter.update(3.0, terms(3.0));

        assert_eq!(meter.count(), 2);
        assert_eq!(meter.mean(), Some(2.0));
        let mean = meter.mean_terms();
        assert_eq!(mean.xy, 2.0);
        assert_eq!(mean.wh, 4.0);
        assert_eq!(mean.class, 0.5);
        assert_eq!(meter.epoch_loss("training"), 2.0);
    }

    #[test]
    fn test_empty_epoch_is_infinite() {
        let meter = LossMeter::new();
        assert_eq!(meter.epoch_loss("training"), f32::INFINITY);
        assert_eq!(meter.epoch_loss("validation"), f32::INFINITY);
    }
}
