use std::sync::Arc;

use anyhow::{Context, Result};

use startgrid::logging::tick_aggregator;
use startgrid::store::rest::RestStore;
use startgrid::store::RemoteStore;
use startgrid::{Config, Session};

/// Viewer: reprints the grid whenever the shared state changes.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store: Arc<dyn RemoteStore> = Arc::new(RestStore::new(&cfg).context("building store client")?);
    let mut session = Session::observe(store, cfg).await.context("starting session")?;

    eprintln!("[grid-display] following session {}", session.session_id());
    println!("{}\n", session.snapshot());

    while let Some(result) = session.next_change().await {
        tick_aggregator();
        match result {
            Ok(true) => println!("{}\n", session.snapshot()),
            Ok(false) => {}
            Err(err) => eprintln!("[grid-display] {}", err),
        }
    }

    eprintln!("[grid-display] every feed closed, exiting");
    Ok(())
}
