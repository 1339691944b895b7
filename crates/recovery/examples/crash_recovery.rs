//! Example showing a transaction left in doubt and completed by recovery
//!
//! A transaction spans two mock resources; the second one fails its commit
//! after the decision was journaled. The background recovery task then finds
//! the dangling transaction and commits the in-doubt branch.
//!
//! Run with: cargo run -p twophase-recovery --example crash_recovery

use std::sync::Arc;
use std::time::Duration;
use twophase_common::XaErrorCode;
use twophase_coordinator::mock::{MockOp, MockProducer, MockResource};
use twophase_coordinator::{Coordinator, CoordinatorConfig, ResourceRegistry};
use twophase_journal::{DiskJournal, JournalConfig};
use twophase_recovery::{Recoverer, RecoveryConfig, task};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Crash Recovery Example ===\n");

    // 1. Journal in a scratch directory
    let dir = std::env::temp_dir().join(format!("twophase-example-{}", std::process::id()));
    let journal = Arc::new(DiskJournal::new(JournalConfig::new(&dir)));
    println!("✓ Journal files in {}", dir.display());

    // 2. Two resources, the message queue will fail its commit
    let registry = Arc::new(ResourceRegistry::new());
    let db = Arc::new(MockProducer::new(Arc::new(MockResource::new("db"))));
    let mq = Arc::new(MockProducer::new(Arc::new(MockResource::new("mq"))));
    registry.register(db.clone())?;
    registry.register(mq.clone())?;
    mq.resource().fail_on(MockOp::Commit, XaErrorCode::RmFail);

    let coordinator = Coordinator::new(CoordinatorConfig::new("example-node"), journal, registry)?;
    println!("✓ Coordinator {} started", coordinator.server_id());

    // 3. Run the transaction
    let tx = coordinator.begin()?;
    tx.enlist(db.resource().clone())?;
    tx.enlist(mq.resource().clone())?;
    tx.commit()?;
    println!("✓ Committed {}", tx);
    println!("  mq branches in doubt: {}", mq.resource().in_doubt().len());

    // 4. The queue comes back, let background recovery finish the job
    mq.resource().clear_failure(MockOp::Commit);
    let recoverer = Arc::new(Recoverer::for_coordinator(RecoveryConfig::new(), &coordinator));
    let handle = task::start(recoverer.clone(), Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(250)).await;
    handle.abort();

    println!("✓ Recovery ran {} time(s)", recoverer.executions_count());
    println!("  mq branches in doubt: {}", mq.resource().in_doubt().len());

    coordinator.shutdown();
    std::fs::remove_dir_all(&dir)?;
    println!("\n=== Example Complete ===");
    Ok(())
}
