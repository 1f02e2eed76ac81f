pub mod async_stall;
pub mod double_lock;
pub mod lock_order_cycle;
pub mod read_then_write;

use lockwatch::{StallHandler, StallReport, default_stall_handler, stall_handler};

/// Logs like the default handler and also forwards the report to `forward`.
pub fn logging_and(forward: impl Fn(StallReport) + Send + Sync + 'static) -> StallHandler {
    let log = default_stall_handler();
    stall_handler(move |report| {
        log(report);
        forward(report.clone());
    })
}
