use std::future::Future;
use std::thread::JoinHandle;
use syncrl_core::validation::CancelToken;
use tokio::signal;

/// Cancels `token` on Ctrl+C or SIGTERM. Training stops at the next update boundary and
/// running validation workers stop at their next step.
pub fn cancel_on_shutdown(token: CancelToken) -> std::io::Result<JoinHandle<()>> {
    cancel_when(shutdown_signal(), token)
}

/// Waits for `shutdown` on a dedicated thread with its own single threaded runtime, then cancels
/// `token`. The trainer itself stays synchronous.
pub fn cancel_when<F>(shutdown: F, token: CancelToken) -> std::io::Result<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    std::thread::Builder::new()
        .name("syncrl-shutdown".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("failed to start the shutdown listener: {e}");
                    return;
                }
            };
            runtime.block_on(shutdown);
            tracing::warn!("shutdown requested, cancelling training");
            token.cancel();
        })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod test {
    use super::cancel_when;
    use anyhow::Result;
    use std::time::Duration;
    use syncrl_core::validation::CancelToken;
    use tokio::sync::oneshot;

    #[test]
    fn token_is_cancelled_once_the_signal_fires() -> Result<()> {
        let token = CancelToken::new();
        let (tx, rx) = oneshot::channel::<()>();
        let listener = cancel_when(
            async move {
                let _ = rx.await;
            },
            token.clone(),
        )?;
        std::thread::sleep(Duration::from_millis(50));
        assert!(!token.is_cancelled());
        assert!(!listener.is_finished());

        tx.send(()).map_err(|_| anyhow::anyhow!("listener dropped"))?;
        listener
            .join()
            .map_err(|_| anyhow::anyhow!("listener panicked"))?;
        assert!(token.is_cancelled());
        Ok(())
    }
}
