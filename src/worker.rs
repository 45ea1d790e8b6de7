//! Worker threads and the transactional retry harness.

use crate::events::Event;
use crate::mutator::{EventError, TxCtx};
use crate::Runtime;

pub(crate) fn worker_loop(runtime: &Runtime, index: usize) {
    tracing::debug!(worker = index, "worker started");
    let mut active = false;
    while let Some(event) = runtime.queue().next(&mut active) {
        run_until_commit(runtime, &event);
    }
    tracing::debug!(worker = index, "worker drained");
}

/// The worker-loop contract: start a transaction, execute the event, commit;
/// on failure discard the attempt and run the event again. An execution cut
/// short by a terminate signal falls through to commit, which reports the
/// abort.
fn run_until_commit(runtime: &Runtime, event: &Event) {
    loop {
        let session = runtime.stm().start_transaction();
        let mut ctx = TxCtx::new(runtime, session);
        let result = event.execute(&mut ctx);
        let session = ctx.into_session();

        if runtime.stm().commit_transaction(session) {
            // Only a committed attempt's error is real; aborted attempts
            // start the retry with a clean slate.
            if let Err(err) = result {
                debug_assert!(
                    !matches!(err, EventError::Terminated),
                    "a terminated attempt cannot commit"
                );
                tracing::warn!(%err, "committed event reported an error");
                runtime.record_error(err);
            }
            return;
        }
        tracing::trace!("event aborted, retrying");
    }
}
