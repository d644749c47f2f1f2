use crate::execution::gateway::{EntryFill, PositionSnapshot, StopChange};
use crate::models::{Direction, OpenPosition, Side};

/// What a broker reconciliation changed
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Unchanged,
    /// Broker reports no trade: stop-loss or take-profit filled
    ClosedByBroker,
    /// Broker holds a trade this process did not know about
    Adopted,
}

/// Holder of the single open position
///
/// The position, its order references and the stop-adjustment flag are one
/// `Option<OpenPosition>`; every mutation replaces or edits it in one step
/// after the broker confirmed the corresponding fill.
#[derive(Debug, Default)]
pub struct PositionManager {
    open: Option<OpenPosition>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn side(&self) -> Side {
        self.open
            .as_ref()
            .map_or(Side::Flat, |p| Side::from(p.direction))
    }

    pub fn open_position(&self) -> Option<&OpenPosition> {
        self.open.as_ref()
    }

    /// Align local state with the broker's view of the account
    pub fn reconcile(&mut self, snapshot: Option<&PositionSnapshot>) -> Reconciliation {
        match (self.open.as_ref(), snapshot) {
            (None, None) => Reconciliation::Unchanged,
            (Some(_), None) => {
                self.open = None;
                Reconciliation::ClosedByBroker
            }
            (Some(open), Some(snap))
                if open.direction == snap.direction && open.trade_id == snap.trade_id =>
            {
                // The broker's order ids are authoritative for a known trade
                if let Some(open) = self.open.as_mut() {
                    if snap.stop_loss_id.is_some() {
                        open.stop_loss_id = snap.stop_loss_id.clone();
                    }
                    if snap.take_profit_id.is_some() {
                        open.take_profit_id = snap.take_profit_id.clone();
                    }
                }
                Reconciliation::Unchanged
            }
            (_, Some(snap)) => {
                self.open = Some(OpenPosition {
                    direction: snap.direction,
                    trade_id: snap.trade_id.clone(),
                    stop_loss_id: snap.stop_loss_id.clone(),
                    take_profit_id: snap.take_profit_id.clone(),
                    fill_price: snap.price,
                    fill_time: None,
                    sl_changed: false,
                });
                Reconciliation::Adopted
            }
        }
    }

    /// A new position was filled (fresh entry or reversal)
    pub fn record_entry(&mut self, direction: Direction, fill: &EntryFill) {
        self.open = Some(OpenPosition {
            direction,
            trade_id: fill.trade_id.clone(),
            stop_loss_id: Some(fill.stop_loss_id.clone()),
            take_profit_id: Some(fill.take_profit_id.clone()),
            fill_price: fill.price,
            fill_time: Some(fill.time),
            sl_changed: false,
        });
    }

    /// The position was closed by our own order
    pub fn record_exit(&mut self) {
        self.open = None;
    }

    /// Stop-loss to tighten, if the position qualifies
    ///
    /// Returns (trade_id, stop_loss_id, new stop price) when a position is open,
    /// its stop has not been moved yet and `unrealized_pl` exceeds `threshold`.
    pub fn stop_to_tighten(&self, unrealized_pl: f64, threshold: f64) -> Option<(String, String, f64)> {
        let open = self.open.as_ref()?;
        if open.sl_changed || unrealized_pl <= threshold {
            return None;
        }
        let stop_loss_id = open.stop_loss_id.clone()?;
        Some((open.trade_id.clone(), stop_loss_id, open.fill_price))
    }

    /// Stop-loss replaced; the broker issued a new order id for it
    pub fn record_stop_change(&mut self, change: &StopChange) {
        if let Some(open) = self.open.as_mut() {
            open.stop_loss_id = Some(change.order_id.clone());
            open.sl_changed = true;
        }
    }
}
