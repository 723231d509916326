//! Consumer/dispatcher: broker deliveries in, validated work items out.
//!
//! The dispatcher never touches job state. Malformed notifications are
//! poison: they are nacked without requeue so broker policy can dead-letter
//! them, and they never reach the executor.

use futures::StreamExt as _;
use lapin::{message::Delivery, options::BasicNackOptions, Consumer};
use monitoring::logging;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{notif, pool::WorkItem};

/// Run the dispatch loop until the stop signal, the delivery stream closing,
/// or the work channel closing.
pub(crate) async fn run(
    mut consumer: Consumer,
    work_tx: mpsc::Sender<WorkItem>,
    stop: CancellationToken,
) {
    tracing::debug!("message dispatcher started");

    loop {
        let delivery = tokio::select! {
            () = stop.cancelled() => {
                tracing::debug!("message dispatcher stopping, stop signaled");
                return;
            }
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    tracing::error!(
                        error = %err,
                        error_source = logging::error_source(&err),
                        "broker delivery error"
                    );
                    continue;
                }
                None => {
                    // Workers keep draining whatever is already queued.
                    tracing::error!("broker delivery stream closed, dispatcher exiting");
                    return;
                }
            },
        };

        let notif = match notif::parse(&delivery.data) {
            Ok(notif) => notif,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    error_source = logging::error_source(&err),
                    "poison notification, dropping to dead-letter policy"
                );
                nack(&delivery, false).await;
                continue;
            }
        };

        let item = WorkItem {
            job_id: notif.job_id,
            delivery_tag: delivery.delivery_tag,
        };

        tokio::select! {
            res = work_tx.send(item) => {
                if res.is_err() {
                    // The pool is gone; give the notification back.
                    tracing::warn!(job_id = %item.job_id, "work channel closed, requeueing notification");
                    nack(&delivery, true).await;
                    return;
                }
                tracing::debug!(
                    job_id = %item.job_id,
                    delivery_tag = item.delivery_tag,
                    "job dispatched to worker pool"
                );
            }
            () = stop.cancelled() => {
                // The hand-off would block while shutting down: requeue so
                // another worker can pick the job up.
                tracing::debug!(job_id = %item.job_id, "stop signaled while dispatching, requeueing notification");
                nack(&delivery, true).await;
                return;
            }
        }
    }
}

/// Nack one delivery on its own channel; failures are logged only, the
/// delivery will be redelivered after the visibility timeout.
async fn nack(delivery: &Delivery, requeue: bool) {
    let res = delivery
        .acker
        .nack(BasicNackOptions {
            multiple: false,
            requeue,
        })
        .await;
    if let Err(err) = res {
        tracing::warn!(
            delivery_tag = delivery.delivery_tag,
            error = %err,
            requeue,
            "failed to nack delivery"
        );
    }
}
