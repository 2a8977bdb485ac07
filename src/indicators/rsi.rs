use std::collections::VecDeque;

/// Neutral score returned while there is not enough history
pub const NEUTRAL_RSI: f64 = 50.0;

/// Streaming Relative Strength Index (RSI)
///
/// Fed one price at a time. Each tick's percentage change goes into either the
/// gain or the loss window (the other gets a zero); both windows hold at most
/// `period` samples. Averages are plain means over the window, not Wilder's
/// smoothing.
///
/// Values:
/// - RSI > 60: overbought for the mean reversion strategy
/// - RSI < 40: oversold
#[derive(Debug, Clone)]
pub struct RsiCalculator {
    period: usize,
    prev_price: Option<f64>,
    gains: VecDeque<f64>,
    losses: VecDeque<f64>,
}

impl RsiCalculator {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            prev_price: None,
            gains: VecDeque::with_capacity(period + 1),
            losses: VecDeque::with_capacity(period + 1),
        }
    }

    /// Feed a price and get the current score in `[0, 100]`
    pub fn update(&mut self, price: f64) -> f64 {
        let prev = match self.prev_price {
            Some(prev) if prev != 0.0 => prev,
            _ => {
                self.prev_price = Some(price);
                return NEUTRAL_RSI;
            }
        };

        let change = (price - prev) / prev * 100.0;
        self.prev_price = Some(price);

        if change > 0.0 {
            self.gains.push_back(change);
            self.losses.push_back(0.0);
        } else {
            self.gains.push_back(0.0);
            self.losses.push_back(-change);
        }

        while self.gains.len() > self.period {
            self.gains.pop_front();
            self.losses.pop_front();
        }

        if self.gains.len() < self.period {
            return NEUTRAL_RSI;
        }

        let avg_gain = average(&self.gains);
        let avg_loss = average(&self.losses);

        if avg_loss == 0.0 {
            if avg_gain == 0.0 {
                return NEUTRAL_RSI;
            }
            return 100.0;
        }

        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }
}

fn average(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
