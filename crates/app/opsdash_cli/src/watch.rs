//! `opsdash watch`: the simplest consumer of the session controller.

use std::sync::Arc;

use opsdash_core::auth::recovery::MemoryLocation;
use opsdash_core::auth::{
    AuthSnapshot, AuthStage, ControllerConfig, IdentitySource, Location, SessionController,
    classify_url,
};
use opsdash_core::backend::{BackendConfig, HttpIdentitySource};
use tracing::{info, warn};

use crate::Result;
use crate::cli::WatchArgs;

pub async fn run(args: WatchArgs) -> Result<()> {
    let backend = BackendConfig::from_env()?;
    info!(base_url = %backend.base_url, rpc = %backend.details_rpc, "using backend");
    let source = Arc::new(HttpIdentitySource::new(backend));

    // Provider work happens before activation, as on a real page load.
    if let Some(url) = &args.url
        && classify_url(url).is_pending()
        && source.session_from_url(url).await?.is_none()
    {
        warn!("recovery link carried no tokens");
    }
    if let (Some(email), Some(password)) = (&args.email, &args.password) {
        source.sign_in_with_password(email, password).await?;
    }

    let location: Option<Arc<dyn Location>> = args
        .url
        .as_ref()
        .map(|url| Arc::new(MemoryLocation::new(url.as_str())) as Arc<dyn Location>);
    let shared: Arc<dyn IdentitySource> = source.clone();
    let handle = SessionController::spawn(shared, ControllerConfig::from_env(), location);

    let mut snapshots = handle.subscribe();
    let mut password_sent = false;
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        print_snapshot(&snapshot)?;

        if snapshot.stage == AuthStage::NeedsPasswordSet
            && !password_sent
            && let Some(new_password) = &args.new_password
        {
            source.update_password(new_password).await?;
            password_sent = true;
        } else if args.once && snapshot.stage.is_settled() && !snapshot.fetch_in_flight {
            break;
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("session controller stopped");
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupted");
                break;
            }
        }
    }

    if args.sign_out_on_exit {
        handle.sign_out().await?;
        let snapshot = handle
            .wait_for(|s| s.stage == AuthStage::Unauthenticated)
            .await?;
        print_snapshot(&snapshot)?;
    }
    handle.shutdown();
    Ok(())
}

fn print_snapshot(snapshot: &AuthSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string(snapshot)?);
    Ok(())
}
