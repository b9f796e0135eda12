use super::PoolServices;
use crate::events::category;
use crate::server::{client_label, ClientEvent, ClientEventReceiver, StratumClient, SubmitParams};
use crate::types::ShareSubmission;
use std::sync::Arc;

/// Drive one miner connection until it disconnects
pub async fn handle_client(
    services: PoolServices,
    client: Arc<dyn StratumClient>,
    mut events: ClientEventReceiver,
    difficulty: f64,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Subscription { respond } => {
                let extra_nonce1 = services.job_manager.next_extra_nonce1();
                respond(extra_nonce1, services.job_manager.extra_nonce2_size());

                client.send_difficulty_if_new(difficulty);

                match services.job_manager.current_job().await {
                    Some(job) => client.send_mining_job(job.job_params()),
                    None => services.events.warning(category::CLIENT, "A miner subscribed but no job to dispatch!"),
                }
            }
            ClientEvent::Submit { params, respond } => {
                let submission = build_submission(client.as_ref(), params);
                let response = services.job_manager.process_share(submission).await;
                respond(response.error, response.result.is_some());
            }
            ClientEvent::MalformedMessage(message) => {
                services.events.warning(
                    category::CLIENT,
                    format!("{} has sent us a malformed message: {}", client_label(client.as_ref()), message),
                );
            }
            ClientEvent::SocketError(error) => {
                services.events.warning(
                    category::CLIENT,
                    format!("{} has somehow had a socket error: {}", client_label(client.as_ref()), error),
                );
            }
            ClientEvent::SocketDisconnect => {
                services.events.debug(
                    category::CLIENT,
                    format!("Client '{}' disconnected!", client_label(client.as_ref())),
                );
                break;
            }
            ClientEvent::UnknownStratumMethod(method) => {
                services.events.debug(
                    category::CLIENT,
                    format!("{} has sent us an unknown stratum method: {}", client_label(client.as_ref()), method),
                );
            }
        }
    }
}

fn build_submission(client: &dyn StratumClient, params: SubmitParams) -> ShareSubmission {
    ShareSubmission {
        job_id: params.job_id,
        difficulty: client.difficulty(),
        extra_nonce1: client.extra_nonce1().unwrap_or_default(),
        extra_nonce2: params.extra_nonce2,
        ntime: params.ntime,
        nonce: params.nonce,
        ip: client.remote_address(),
        worker: params.worker,
    }
}
