use std::sync::Arc;

use chrono::Utc;
use keel_common::config::AppConfig;
use keel_server::{Actor, ActorAction, ActorHandle};
use log::info;
use tokio::sync::mpsc;

use crate::chunk_list::ChunkListAllocator;
use crate::cluster::ExecNodeTracker;
use crate::error::{ControllerError, ControllerResult};
use crate::id::OperationId;
use crate::master::MasterClient;
use crate::operation::controller::{OperationController, ReviveOutcome};
use crate::operation::event::ControllerEvent;
use crate::operation::spec::OperationSpec;
use crate::operation::state::ControllerState;

impl From<mpsc::error::SendError<ControllerEvent>> for ControllerError {
    fn from(error: mpsc::error::SendError<ControllerEvent>) -> Self {
        ControllerError::InternalError(error.to_string())
    }
}

pub struct ControllerActorOptions {
    pub operation_id: OperationId,
    pub spec: OperationSpec,
    pub config: AppConfig,
    pub chunk_lists: Box<dyn ChunkListAllocator>,
    pub master: Arc<dyn MasterClient>,
    pub nodes: Arc<ExecNodeTracker>,
}

/// The per-operation execution context: every controller mutation goes
/// through this actor's mailbox, one message at a time. Master calls are
/// spawned off the context and rejoin as internal events.
pub struct ControllerActor {
    controller: OperationController,
}

impl Actor for ControllerActor {
    type Message = ControllerEvent;
    type Options = ControllerActorOptions;
    type Error = ControllerError;

    fn new(options: Self::Options) -> Self {
        let controller = OperationController::new(
            options.operation_id,
            options.spec,
            &options.config,
            options.chunk_lists,
            options.master,
            options.nodes,
        );
        Self { controller }
    }

    fn start(&mut self, handle: &ActorHandle<Self>) -> Result<(), Self::Error> {
        let handle = handle.clone();
        let period = self.controller.time_limit_check_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if handle.send(ControllerEvent::CheckTimeLimit).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn receive(
        &mut self,
        message: Self::Message,
        handle: &ActorHandle<Self>,
    ) -> Result<ActorAction, Self::Error> {
        match message {
            ControllerEvent::Initialize { reply } => {
                let _ = reply.send(self.controller.initialize());
            }
            ControllerEvent::Prepare { reply } => {
                let master = self.controller.master();
                let title = self.controller.state().spec.title.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    let result = OperationController::start_transactions(master, title).await;
                    let _ = handle
                        .send(ControllerEvent::TransactionsStarted { result, reply })
                        .await;
                });
            }
            ControllerEvent::TransactionsStarted { result, reply } => match result {
                Ok(transactions) => {
                    self.controller.finish_prepare(transactions);
                    let _ = reply.send(Ok(()));
                }
                Err(error) => {
                    let _ = reply.send(Err(error));
                }
            },
            ControllerEvent::Materialize { reply } => {
                match self.controller.materialize() {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(error) => {
                        let message = format!("materialization failed: {error}");
                        self.controller.fail_operation(&message);
                        let _ = reply.send(Err(ControllerError::OperationFailed(message)));
                    }
                }
            }
            ControllerEvent::Revive { reply } => {
                let master = self.controller.master();
                let operation_id = self.controller.operation_id();
                let title = self.controller.state().spec.title.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    let blob = match master.download_snapshot(operation_id).await {
                        Ok(blob) => blob,
                        Err(error) => {
                            info!("failed to download snapshot, will use clean start: {error}");
                            None
                        }
                    };
                    match OperationController::start_transactions(Arc::clone(&master), title).await
                    {
                        Ok(transactions) => {
                            if blob.is_none() {
                                let _ = master.remove_snapshot(operation_id).await;
                            }
                            let _ = handle
                                .send(ControllerEvent::SnapshotDownloaded {
                                    transactions,
                                    blob,
                                    reply,
                                })
                                .await;
                        }
                        Err(error) => {
                            let _ = reply.send(Err(error));
                        }
                    }
                });
            }
            ControllerEvent::SnapshotDownloaded {
                transactions,
                blob,
                reply,
            } => {
                self.controller.finish_prepare(transactions);
                match blob {
                    Some(blob) => match self.controller.finish_revive(&blob) {
                        Ok(()) => {
                            let _ = reply.send(Ok(ReviveOutcome::FromSnapshot));
                        }
                        Err(error) => {
                            let message = format!("revival failed: {error}");
                            self.controller.fail_operation(&message);
                            let _ = reply.send(Err(ControllerError::OperationFailed(message)));
                        }
                    },
                    None => {
                        info!("using clean start instead of revive");
                        let _ = reply.send(Ok(ReviveOutcome::CleanStart));
                    }
                }
            }
            ControllerEvent::ScheduleJob {
                context,
                job_limits,
                reply,
            } => {
                let result = self.controller.schedule_job(&context, job_limits);
                let _ = reply.send(Box::new(result));
            }
            ControllerEvent::JobStarted { job_id, start_time } => {
                self.controller.on_job_started(job_id, start_time);
            }
            ControllerEvent::JobCompleted { summary } => {
                self.controller.on_job_completed(summary);
            }
            ControllerEvent::JobFailed { summary } => {
                self.controller.on_job_failed(summary);
            }
            ControllerEvent::JobAborted { summary } => {
                self.controller.on_job_aborted(summary);
            }
            ControllerEvent::InputChunkLocated { chunk_id, replicas } => {
                self.controller.on_input_chunk_located(chunk_id, replicas);
            }
            ControllerEvent::IntermediateChunkUnavailable { chunk_id } => {
                self.controller.on_intermediate_chunk_unavailable(chunk_id);
            }
            ControllerEvent::SaveSnapshot { reply } => {
                let _ = reply.send(self.controller.save_snapshot());
            }
            ControllerEvent::GetProgress { reply } => {
                let _ = reply.send(self.controller.progress());
            }
            ControllerEvent::CheckTimeLimit => {
                self.controller.check_time_limit(Utc::now());
            }
            ControllerEvent::Commit { reply } => {
                if self.controller.lifecycle() != ControllerState::Completed {
                    let _ = reply.send(Err(ControllerError::InvalidOperationState {
                        expected: "completed".to_string(),
                        actual: self.controller.lifecycle().to_string(),
                    }));
                } else {
                    let transactions = self.controller.take_transactions();
                    let master = self.controller.master();
                    tokio::spawn(async move {
                        let result: ControllerResult<()> = async {
                            if let Some(transactions) = transactions {
                                master.commit_transaction(transactions.input).await?;
                                master.commit_transaction(transactions.output).await?;
                            }
                            Ok(())
                        }
                        .await;
                        let _ = reply.send(result);
                    });
                }
            }
            ControllerEvent::Abort { reply } => {
                let transactions = self.controller.take_transactions();
                let master = self.controller.master();
                self.controller.finish_abort();
                tokio::spawn(async move {
                    if let Some(transactions) = transactions {
                        let _ = master.abort_transaction(transactions.input).await;
                        let _ = master.abort_transaction(transactions.output).await;
                    }
                    let _ = reply.send(());
                });
            }
            ControllerEvent::Shutdown => {
                return Ok(ActorAction::Stop);
            }
        }
        Ok(ActorAction::Continue)
    }

    fn stop(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::sync::oneshot;

    use super::*;
    use crate::chunk_list::ChunkListPool;
    use crate::master::InMemoryMaster;
    use crate::operation::job::{CompletedJobSummary, JobStatistics, JobType};
    use crate::resources::JobResources;
    use crate::testing::*;

    fn actor_options() -> ControllerActorOptions {
        let spec = spec(vec![definition(
            "map",
            profile(JobType::Map),
            vec![stripe(1, 100, &[1])],
        )]);
        ControllerActorOptions {
            operation_id: OperationId::from(1),
            spec,
            config: test_config(),
            chunk_lists: Box::new(ChunkListPool::with_uniform_capacity(&[0, 1], 8)),
            master: Arc::new(InMemoryMaster::new()),
            nodes: node_tracker(&[(1, big_node_limits())]),
        }
    }

    #[tokio::test]
    async fn test_actor_drives_an_operation_to_completion() {
        let handle = ActorHandle::<ControllerActor>::new(actor_options());

        let (tx, rx) = oneshot::channel();
        handle.send(ControllerEvent::Initialize { reply: tx }).await.unwrap();
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        handle.send(ControllerEvent::Prepare { reply: tx }).await.unwrap();
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        handle.send(ControllerEvent::Materialize { reply: tx }).await.unwrap();
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        handle
            .send(ControllerEvent::ScheduleJob {
                context: context(1, Utc::now()),
                job_limits: JobResources::new(8.0, 10_000, 8, 0),
                reply: tx,
            })
            .await
            .unwrap();
        let result = rx.await.unwrap();
        let request = result.start_request.expect("the heartbeat must match");

        handle
            .send(ControllerEvent::JobStarted {
                job_id: request.job_id,
                start_time: Utc::now(),
            })
            .await
            .unwrap();
        handle
            .send(ControllerEvent::JobCompleted {
                summary: CompletedJobSummary {
                    job_id: request.job_id,
                    abandoned: false,
                    statistics: JobStatistics {
                        output_chunk_counts: vec![1],
                        ..Default::default()
                    },
                    output_stripe: None,
                },
            })
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        handle.send(ControllerEvent::GetProgress { reply: tx }).await.unwrap();
        let progress = rx.await.unwrap();
        assert_eq!(progress.state, ControllerState::Completed);
        assert_eq!(progress.counter.completed, 1);

        let (tx, rx) = oneshot::channel();
        handle.send(ControllerEvent::Commit { reply: tx }).await.unwrap();
        rx.await.unwrap().unwrap();

        handle.send(ControllerEvent::Shutdown).await.unwrap();
        handle.wait_for_stop().await;
    }
}
