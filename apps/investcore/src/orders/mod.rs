mod basket;
mod engine;
mod store;
mod worker;

pub use basket::{Basket, BasketStore, MemoryBasketStore, PostgresBasketStore, RiskLevel};
pub use engine::{FillOutcome, OrderEngine};
pub use store::{
    MemoryOrderStore, MemoryPositionStore, Order, OrderStatus, OrderStore, Position, PositionStore,
    PostgresOrderStore, PostgresPositionStore,
};
pub use worker::OrderSubmissionWorker;
