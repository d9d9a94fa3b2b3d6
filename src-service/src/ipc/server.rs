//! IPC server with secure socket setup.

use std::path::Path;
use std::sync::Arc;

use subtext_common::ipc::{get_socket_path, read_json, write_json, IpcError, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::handlers::handle_request;
use crate::pipeline::ServiceState;

/// Socket file permissions (owner read/write only)
#[cfg(unix)]
const SOCKET_MODE: u32 = 0o600;

/// Socket directory permissions (owner read/write/execute only)
#[cfg(unix)]
const DIRECTORY_MODE: u32 = 0o700;

/// Create socket directory with secure permissions.
#[cfg(unix)]
fn create_secure_socket_dir(socket_path: &Path) -> std::io::Result<()> {
    let socket_dir = socket_path
        .parent()
        .expect("Socket must have parent directory");

    std::fs::create_dir_all(socket_dir)?;
    std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;

    // Remove stale socket if exists
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

/// Set socket file permissions after binding.
#[cfg(unix)]
fn secure_socket_file(socket_path: &Path) -> std::io::Result<()> {
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    let actual = std::fs::metadata(socket_path)?.permissions().mode() & 0o777;
    if actual != SOCKET_MODE {
        warn!("Socket mode is {:o}, expected {:o}", actual, SOCKET_MODE);
    }

    Ok(())
}

/// Handle a single client connection.
async fn handle_client<S>(state: Arc<ServiceState>, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        // Read request
        let request: Request = match read_json(&mut stream).await {
            Ok(req) => req,
            Err(IpcError::ConnectionClosed) => {
                info!("Client disconnected");
                break;
            }
            Err(e) => {
                error!("Error reading request: {}", e);
                break;
            }
        };

        // Validate request parameters before any resources are touched.
        if let Err(e) = request.validate() {
            warn!("Invalid request: {}", e);
            let response = Response::error(format!("Invalid request: {}", e));
            if let Err(e) = write_json(&mut stream, &response).await {
                error!("Error writing response: {}", e);
                break;
            }
            continue;
        }

        // Handle request
        let response = handle_request(Arc::clone(&state), request).await;

        // Write response
        if let Err(e) = write_json(&mut stream, &response).await {
            error!("Error writing response: {}", e);
            break;
        }
    }
}

/// Run the IPC server until shutdown is requested.
#[cfg(unix)]
pub async fn run_server(state: Arc<ServiceState>) -> Result<(), Box<dyn std::error::Error>> {
    use tokio::net::UnixListener;

    let socket_path = get_socket_path();
    info!("Starting IPC server at {:?}", socket_path);

    create_secure_socket_dir(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)?;
    secure_socket_file(&socket_path)?;

    info!("IPC server listening on {:?}", socket_path);

    loop {
        if crate::is_shutdown_requested() {
            info!("Shutdown requested, stopping IPC server");
            break;
        }

        // Use select so the shutdown flag is checked periodically even
        // with no incoming connections.
        let accept_result = tokio::select! {
            result = listener.accept() => Some(result),
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => None,
        };

        let (stream, _) = match accept_result {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => {
                error!("Accept error: {}", e);
                continue;
            }
            None => continue,
        };

        info!("Client connected");
        let state = Arc::clone(&state);
        tokio::spawn(handle_client(state, stream));
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

#[cfg(not(unix))]
pub async fn run_server(_state: Arc<ServiceState>) -> Result<(), Box<dyn std::error::Error>> {
    Err("the subtext service only runs on Unix hosts".into())
}
