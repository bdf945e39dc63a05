use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::adapters::brokerage::{BrokerageAdapter, BrokerageOrderStatus, OrderSide};
use crate::audit::{AuditEntryDraft, AuditLog};
use crate::balances::BalancesStore;
use crate::error::CoreError;
use crate::idempotency::IdempotencyBackend;
use crate::job_store::JobStore;

use super::basket::BasketStore;
use super::store::{Order, OrderStatus, OrderStore, PositionStore};

/// Terminal/non-terminal shape of a reconciled brokerage fill event
/// (§4.H Reconciliation).
#[derive(Debug, Clone, Copy)]
pub enum FillOutcome {
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

/// Places basket orders, reserves buying power (buy) or position quantity
/// (sell), and reconciles asynchronous fills (§4.H). Position reservation
/// mirrors the reserve/consume/release arithmetic `Balances` already exposes.
pub struct OrderEngine {
    orders: Arc<dyn OrderStore>,
    positions: Arc<dyn PositionStore>,
    baskets: Arc<dyn BasketStore>,
    balances: Arc<dyn BalancesStore>,
    brokerage: Arc<dyn BrokerageAdapter>,
    idempotency: Arc<IdempotencyBackend>,
    audit: Arc<dyn AuditLog>,
    jobs: Arc<dyn JobStore>,
    job_max_attempts: u32,
    notification_max_attempts: u32,
}

impl OrderEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<dyn OrderStore>,
        positions: Arc<dyn PositionStore>,
        baskets: Arc<dyn BasketStore>,
        balances: Arc<dyn BalancesStore>,
        brokerage: Arc<dyn BrokerageAdapter>,
        idempotency: Arc<IdempotencyBackend>,
        audit: Arc<dyn AuditLog>,
        jobs: Arc<dyn JobStore>,
        job_max_attempts: u32,
        notification_max_attempts: u32,
    ) -> Self {
        Self {
            orders,
            positions,
            baskets,
            balances,
            brokerage,
            idempotency,
            audit,
            jobs,
            job_max_attempts,
            notification_max_attempts,
        }
    }

    /// Validates, reserves funds (buy) or share quantity (sell), inserts
    /// the order, and dispatches to the brokerage (§4.H "Create order").
    pub async fn create_order(
        &self,
        user_id: Uuid,
        basket_id: Uuid,
        side: OrderSide,
        notional_amount: Decimal,
    ) -> Result<Order, CoreError> {
        if notional_amount <= Decimal::ZERO {
            return Err(CoreError::Validation("notional_amount must be positive".to_string()));
        }
        self.baskets
            .get(basket_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("basket {basket_id}")))?;

        let sell_reservation = match side {
            OrderSide::Buy => {
                self.balances.reserve(user_id, notional_amount).await?;
                None
            }
            OrderSide::Sell => {
                let symbol = self.resolve_symbol(basket_id).await?;
                let position = self.positions.get(user_id, &symbol).await?;
                let avg_cost = position.as_ref().map(|p| p.avg_cost).unwrap_or(Decimal::ZERO);
                if avg_cost <= Decimal::ZERO {
                    return Err(CoreError::Conflict(format!("no position in {symbol} to sell")));
                }
                let required_quantity = notional_amount / avg_cost;
                self.positions.reserve(user_id, &symbol, required_quantity).await?;
                Some(required_quantity)
            }
        };

        let order = self.orders.create(user_id, basket_id, side, notional_amount).await?;
        let order = match sell_reservation {
            Some(quantity) => {
                let order_id = order.id;
                self.orders
                    .update(
                        order_id,
                        Box::new(move |o| {
                            o.reserved_remaining = quantity;
                            Ok(())
                        }),
                    )
                    .await?
            }
            None => order,
        };
        self.dispatch_to_brokerage(order).await
    }

    /// Re-attempts submission for an order left `Pending` by a transient
    /// brokerage failure; used by `OrderSubmissionWorker` off the
    /// `order_submit_retry` job queue (§4.H "Dispatch retry").
    pub async fn retry_submission(&self, order_id: Uuid) -> Result<Order, CoreError> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order {order_id}")))?;
        if order.status.is_terminal() || order.status != OrderStatus::Pending {
            return Ok(order);
        }
        self.dispatch_to_brokerage(order).await
    }

    async fn dispatch_to_brokerage(&self, order: Order) -> Result<Order, CoreError> {
        let placement = match self
            .brokerage
            .place_order(&order.basket_id.to_string(), order.side, order.notional_amount)
            .await
        {
            Ok(placement) => placement,
            Err(error) => {
                let core_error: CoreError = error.into();
                if core_error.is_retryable() {
                    self.jobs
                        .enqueue(
                            "order_submit_retry",
                            json!({ "order_id": order.id }),
                            Some(&format!("order-submit-{}", order.id)),
                            self.job_max_attempts,
                        )
                        .await?;
                    return Ok(order);
                }
                return self.reject_and_release(order, &core_error.message()).await;
            }
        };

        match placement.status {
            BrokerageOrderStatus::Accepted => {
                let brokerage_ref = placement.brokerage_ref;
                let order_id = order.id;
                let updated = self
                    .orders
                    .update(
                        order_id,
                        Box::new(move |o| {
                            o.status = OrderStatus::Accepted;
                            o.brokerage_ref = Some(brokerage_ref);
                            Ok(())
                        }),
                    )
                    .await?;
                self.audit
                    .record(AuditEntryDraft {
                        actor: "order_engine".to_string(),
                        action: "order.accepted".to_string(),
                        resource_type: "order".to_string(),
                        resource_id: order_id.to_string(),
                        before: None,
                        after: None,
                        status: "ok".to_string(),
                        amount: Some(updated.notional_amount),
                        currency: Some("USD".to_string()),
                        ip: None,
                        ua: None,
                        error: None,
                    })
                    .await?;
                Ok(updated)
            }
            BrokerageOrderStatus::Rejected => {
                let reason = placement.reject_reason.unwrap_or_else(|| "rejected by brokerage".to_string());
                self.reject_and_release(order, &reason).await
            }
        }
    }

    async fn reject_and_release(&self, order: Order, reason: &str) -> Result<Order, CoreError> {
        if order.reserved_remaining > Decimal::ZERO {
            match order.side {
                OrderSide::Buy => {
                    self.balances.release_reservation(order.user_id, order.reserved_remaining).await?;
                }
                OrderSide::Sell => {
                    let symbol = self.resolve_symbol(order.basket_id).await?;
                    self.positions
                        .release_reservation(order.user_id, &symbol, order.reserved_remaining)
                        .await?;
                }
            }
        }
        let reason_owned = reason.to_string();
        let order_id = order.id;
        let updated = self
            .orders
            .update(
                order_id,
                Box::new(move |o| {
                    o.status = OrderStatus::Rejected;
                    o.reserved_remaining = Decimal::ZERO;
                    o.reject_reason = Some(reason_owned);
                    Ok(())
                }),
            )
            .await?;
        self.audit
            .record(AuditEntryDraft {
                actor: "order_engine".to_string(),
                action: "order.rejected".to_string(),
                resource_type: "order".to_string(),
                resource_id: order_id.to_string(),
                before: None,
                after: None,
                status: "rejected".to_string(),
                amount: None,
                currency: None,
                ip: None,
                ua: None,
                error: Some(reason.to_string()),
            })
            .await?;
        Ok(updated)
    }

    /// Reconciles one fill event keyed by `(brokerage_ref, fill_id)`;
    /// idempotent against redelivery (§4.H Reconciliation).
    pub async fn reconcile_fill(
        &self,
        brokerage_ref: &str,
        fill_id: &str,
        cumulative_filled_quantity: Decimal,
        fill_price: Decimal,
        outcome: FillOutcome,
    ) -> Result<Order, CoreError> {
        let order = self
            .orders
            .get_by_brokerage_ref(brokerage_ref)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order with brokerage_ref {brokerage_ref}")))?;

        if order.status.is_terminal() {
            return Ok(order);
        }

        let event_id = format!("{brokerage_ref}:{fill_id}");
        let order_id = order.id;
        let symbol = self.resolve_symbol(order.basket_id).await?;

        self.idempotency
            .record_or_replay("brokerage_fill", &event_id, || async {
                let delta = (cumulative_filled_quantity - order.filled_quantity).max(Decimal::ZERO);

                if delta > Decimal::ZERO {
                    match order.side {
                        OrderSide::Buy => {
                            self.positions.apply_fill(order.user_id, &symbol, delta, fill_price).await?;
                            let consumed = (delta * fill_price).min(order.reserved_remaining);
                            if consumed > Decimal::ZERO {
                                self.balances.consume_reservation(order.user_id, consumed).await?;
                            }
                        }
                        OrderSide::Sell => {
                            self.positions.apply_fill(order.user_id, &symbol, -delta, fill_price).await?;
                            let consumed = delta.min(order.reserved_remaining);
                            if consumed > Decimal::ZERO {
                                self.positions.consume_reservation(order.user_id, &symbol, consumed).await?;
                            }
                            self.balances.credit(order.user_id, delta * fill_price).await?;
                        }
                    }
                }

                let consumed_this_fill = match order.side {
                    OrderSide::Buy => (delta * fill_price).min(order.reserved_remaining),
                    OrderSide::Sell => delta.min(order.reserved_remaining),
                };

                let terminal = matches!(outcome, FillOutcome::Filled | FillOutcome::Cancelled | FillOutcome::Rejected);
                let new_status = match outcome {
                    FillOutcome::Partial => OrderStatus::PartiallyFilled,
                    FillOutcome::Filled => OrderStatus::Filled,
                    FillOutcome::Cancelled => OrderStatus::Cancelled,
                    FillOutcome::Rejected => OrderStatus::Rejected,
                };
                let leftover_reserved = order.reserved_remaining - consumed_this_fill;

                let updated = self
                    .orders
                    .update(
                        order_id,
                        Box::new(move |o| {
                            o.filled_quantity = cumulative_filled_quantity;
                            o.status = new_status;
                            o.reserved_remaining = if terminal { Decimal::ZERO } else { leftover_reserved.max(Decimal::ZERO) };
                            Ok(())
                        }),
                    )
                    .await?;

                if terminal && leftover_reserved > Decimal::ZERO {
                    match order.side {
                        OrderSide::Buy => {
                            self.balances.release_reservation(order.user_id, leftover_reserved).await?;
                        }
                        OrderSide::Sell => {
                            self.positions
                                .release_reservation(order.user_id, &symbol, leftover_reserved)
                                .await?;
                        }
                    }
                }

                self.audit
                    .record(AuditEntryDraft {
                        actor: "webhook:brokerage_fill".to_string(),
                        action: "order.fill".to_string(),
                        resource_type: "order".to_string(),
                        resource_id: order_id.to_string(),
                        before: None,
                        after: None,
                        status: updated.status.as_str_label().to_string(),
                        amount: Some(delta * fill_price),
                        currency: Some("USD".to_string()),
                        ip: None,
                        ua: None,
                        error: None,
                    })
                    .await?;

                if terminal {
                    self.jobs
                        .enqueue(
                            "send_notification",
                            json!({ "user_id": order.user_id, "category": "order_settled", "order_id": order_id }),
                            Some(&format!("notify-order-{order_id}")),
                            self.notification_max_attempts,
                        )
                        .await?;
                }

                Ok(json!({ "order_id": updated.id }))
            })
            .await?;

        self.orders
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order {order_id}")))
    }

    async fn resolve_symbol(&self, basket_id: Uuid) -> Result<String, CoreError> {
        let basket = self
            .baskets
            .get(basket_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("basket {basket_id}")))?;
        Ok(basket
            .constituents
            .first()
            .map(|c| c.symbol.clone())
            .unwrap_or_else(|| basket.id.to_string()))
    }
}

impl OrderStatus {
    pub(crate) fn as_str_label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::brokerage::MockBrokerageAdapter;
    use crate::audit::MemoryAuditLog;
    use crate::balances::MemoryBalancesStore;
    use crate::idempotency::{IdempotencyBackend, MemoryIdempotencyLedger};
    use crate::job_store::MemoryJobStore;
    use crate::orders::basket::{BasketConstituent, MemoryBasketStore, RiskLevel};
    use crate::orders::store::{MemoryOrderStore, MemoryPositionStore};

    async fn engine_with_balance(
        starting_balance: Decimal,
    ) -> (OrderEngine, Arc<MemoryBalancesStore>, Arc<MemoryPositionStore>, Uuid, Uuid) {
        let orders = Arc::new(MemoryOrderStore::new());
        let positions = Arc::new(MemoryPositionStore::new());
        let baskets = Arc::new(MemoryBasketStore::new());
        let balances = Arc::new(MemoryBalancesStore::new());
        let brokerage = Arc::new(MockBrokerageAdapter);
        let idempotency = Arc::new(IdempotencyBackend::Memory(MemoryIdempotencyLedger::new()));
        let audit = Arc::new(MemoryAuditLog::new("secret"));
        let jobs = Arc::new(MemoryJobStore::new());

        let user_id = Uuid::new_v4();
        balances.credit(user_id, starting_balance).await.unwrap();

        let basket = baskets
            .create(
                "growth-mix",
                RiskLevel::Growth,
                vec![BasketConstituent { symbol: "VOO".to_string(), weight: Decimal::ONE }],
            )
            .await
            .unwrap();

        let engine = OrderEngine::new(
            orders,
            positions.clone(),
            baskets,
            balances.clone(),
            brokerage,
            idempotency,
            audit,
            jobs,
            5,
            5,
        );
        (engine, balances, positions, user_id, basket.id)
    }

    #[tokio::test]
    async fn buy_order_reserves_funds_and_gets_accepted() {
        let (engine, balances, _positions, user_id, basket_id) = engine_with_balance(Decimal::new(100000, 2)).await;
        let order = engine
            .create_order(user_id, basket_id, OrderSide::Buy, Decimal::new(50000, 2))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);
        assert!(order.brokerage_ref.is_some());

        let balances = balances.get_or_create(user_id).await.unwrap();
        assert_eq!(balances.buying_power, Decimal::new(50000, 2));
        assert_eq!(balances.reserved, Decimal::new(50000, 2));
    }

    #[tokio::test]
    async fn buy_order_over_buying_power_is_rejected_before_brokerage_call() {
        let (engine, _balances, _positions, user_id, basket_id) = engine_with_balance(Decimal::new(1000, 2)).await;
        let result = engine.create_order(user_id, basket_id, OrderSide::Buy, Decimal::new(50000, 2)).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn full_fill_consumes_reservation_and_builds_position() {
        let (engine, balances, _positions, user_id, basket_id) = engine_with_balance(Decimal::new(100000, 2)).await;
        let order = engine
            .create_order(user_id, basket_id, OrderSide::Buy, Decimal::new(40000, 2))
            .await
            .unwrap();
        let brokerage_ref = order.brokerage_ref.clone().unwrap();

        let updated = engine
            .reconcile_fill(&brokerage_ref, "fill-1", Decimal::new(10, 0), Decimal::new(4000, 2), FillOutcome::Filled)
            .await
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Filled);

        let balances = balances.get_or_create(user_id).await.unwrap();
        assert_eq!(balances.reserved, Decimal::ZERO);

        // Redelivery of the same fill is a no-op.
        let replay = engine
            .reconcile_fill(&brokerage_ref, "fill-1", Decimal::new(10, 0), Decimal::new(4000, 2), FillOutcome::Filled)
            .await
            .unwrap();
        assert_eq!(replay.status, OrderStatus::Filled);
        let balances_after_replay = balances;
        assert_eq!(balances_after_replay.reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn sell_order_reserves_quantity_and_gets_accepted() {
        let (engine, _balances, positions, user_id, basket_id) = engine_with_balance(Decimal::ZERO).await;
        positions.apply_fill(user_id, "VOO", Decimal::new(10, 0), Decimal::new(40000, 2)).await.unwrap();

        let order = engine
            .create_order(user_id, basket_id, OrderSide::Sell, Decimal::new(200000, 2))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);
        assert_eq!(order.reserved_remaining, Decimal::new(5, 0));

        let position = positions.get(user_id, "VOO").await.unwrap().unwrap();
        assert_eq!(position.reserved, Decimal::new(5, 0));
    }

    #[tokio::test]
    async fn sell_order_over_position_value_is_rejected_before_brokerage_call() {
        let (engine, _balances, positions, user_id, basket_id) = engine_with_balance(Decimal::ZERO).await;
        positions.apply_fill(user_id, "VOO", Decimal::new(2, 0), Decimal::new(40000, 2)).await.unwrap();

        let result = engine.create_order(user_id, basket_id, OrderSide::Sell, Decimal::new(200000, 2)).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));

        let position = positions.get(user_id, "VOO").await.unwrap().unwrap();
        assert_eq!(position.reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn second_concurrent_sell_order_is_rejected_once_quantity_is_reserved() {
        let (engine, _balances, positions, user_id, basket_id) = engine_with_balance(Decimal::ZERO).await;
        positions.apply_fill(user_id, "VOO", Decimal::new(10, 0), Decimal::new(40000, 2)).await.unwrap();

        let first = engine
            .create_order(user_id, basket_id, OrderSide::Sell, Decimal::new(200000, 2))
            .await
            .unwrap();
        assert_eq!(first.reserved_remaining, Decimal::new(5, 0));

        let second = engine.create_order(user_id, basket_id, OrderSide::Sell, Decimal::new(280000, 2)).await;
        assert!(matches!(second, Err(CoreError::Conflict(_))));

        let position = positions.get(user_id, "VOO").await.unwrap().unwrap();
        assert_eq!(position.reserved, Decimal::new(5, 0));
    }

    #[tokio::test]
    async fn full_sell_fill_consumes_position_reservation_and_credits_balance() {
        let (engine, balances, positions, user_id, basket_id) = engine_with_balance(Decimal::ZERO).await;
        positions.apply_fill(user_id, "VOO", Decimal::new(10, 0), Decimal::new(40000, 2)).await.unwrap();

        let order = engine
            .create_order(user_id, basket_id, OrderSide::Sell, Decimal::new(200000, 2))
            .await
            .unwrap();
        let brokerage_ref = order.brokerage_ref.clone().unwrap();

        let updated = engine
            .reconcile_fill(&brokerage_ref, "fill-1", Decimal::new(5, 0), Decimal::new(40000, 2), FillOutcome::Filled)
            .await
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Filled);

        let position = positions.get(user_id, "VOO").await.unwrap().unwrap();
        assert_eq!(position.reserved, Decimal::ZERO);
        assert_eq!(position.quantity, Decimal::new(5, 0));

        let balance = balances.get_or_create(user_id).await.unwrap();
        assert_eq!(balance.buying_power, Decimal::new(200000, 2));
    }
}
