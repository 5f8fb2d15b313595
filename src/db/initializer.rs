//! Per-connection session setup.

use tracing::debug;

use crate::db::connection::Connection;
use crate::db::driver::BackendConnection;
use crate::error::DbResult;
use crate::models::SessionSettings;

/// Applies [`SessionSettings`] to physical connections.
pub struct ConnectionInitializer;

impl ConnectionInitializer {
    /// Bring `conn` in line with `settings`.
    ///
    /// Isolation level and access mode go out as one statement, then the
    /// client encoding, then the decoders in the order given. Nothing is sent
    /// when the connection already carries these settings. A failure leaves
    /// the connection marked as uninitialized so the next checkout retries.
    pub async fn initialize<C: BackendConnection>(
        conn: &mut Connection<C>,
        settings: &SessionSettings,
    ) -> DbResult<()> {
        let wanted = settings.fingerprint();
        if !conn.needs_init(&wanted) {
            return Ok(());
        }

        conn.set_applied(None);
        let raw = conn.raw_mut()?;
        raw.configure_session(settings.isolation, settings.read_only)
            .await?;
        if let Some(encoding) = &settings.encoding {
            raw.set_client_encoding(encoding).await?;
        }

        let registry = conn.decoders_mut();
        registry.clear();
        for decoder in &settings.decoders {
            registry.register(decoder.clone());
        }

        debug!(
            connection = conn.id(),
            isolation = %settings.isolation,
            read_only = settings.read_only,
            encoding = settings.encoding.as_deref().unwrap_or("default"),
            decoders = settings.decoders.len(),
            "Initialized connection"
        );
        conn.set_applied(Some(wanted));
        Ok(())
    }
}
