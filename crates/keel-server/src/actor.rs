use tokio::sync::{mpsc, watch};

const ACTOR_CHANNEL_SIZE: usize = 8;

/// A minimal actor abstraction. Each actor runs on its own Tokio task and
/// processes messages one at a time, so everything the actor owns is mutated
/// from a single logical execution context.
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options;
    type Error: From<mpsc::error::SendError<Self::Message>>;

    fn new(options: Self::Options) -> Self;
    fn start(&mut self, handle: &ActorHandle<Self>) -> Result<(), Self::Error>;
    fn receive(
        &mut self,
        message: Self::Message,
        handle: &ActorHandle<Self>,
    ) -> Result<ActorAction, Self::Error>;
    fn stop(self) -> Result<(), Self::Error>;
}

pub enum ActorAction {
    Continue,
    Stop,
}

pub struct ActorHandle<T>
where
    T: Actor,
{
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T> Clone for ActorHandle<T>
where
    T: Actor,
{
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, mut rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let mut actor = T::new(options);
        let out = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let handle = out.clone();
        tokio::spawn(async move {
            let _ = async {
                actor.start(&handle)?;
                while let Some(message) = rx.recv().await {
                    let action = actor.receive(message, &handle)?;
                    match action {
                        ActorAction::Continue => {}
                        ActorAction::Stop => {
                            break;
                        }
                    }
                }
                actor.stop()
            }
            .await;
            let _ = stopped_tx.send(true);
        });
        out
    }

    pub async fn send(&self, message: T::Message) -> Result<(), T::Error> {
        self.sender.send(message).await.map_err(T::Error::from)
    }

    pub async fn wait_for_stop(mut self) {
        // We ignore the receiver error since the sender must have been dropped in this case,
        // which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, oneshot};

    use super::*;

    struct CounterActor {
        count: u64,
    }

    #[derive(Clone)]
    struct TestError;

    impl<T> From<mpsc::error::SendError<T>> for TestError {
        fn from(_: mpsc::error::SendError<T>) -> Self {
            Self
        }
    }

    enum CounterMessage {
        Add {
            value: u64,
        },
        Get {
            reply: oneshot::Sender<u64>,
        },
        Stop,
    }

    impl Actor for CounterActor {
        type Message = CounterMessage;
        type Options = u64;
        type Error = TestError;

        fn new(options: Self::Options) -> Self {
            Self { count: options }
        }

        fn start(&mut self, _: &ActorHandle<Self>) -> Result<(), Self::Error> {
            Ok(())
        }

        fn receive(
            &mut self,
            message: Self::Message,
            _: &ActorHandle<Self>,
        ) -> Result<ActorAction, Self::Error> {
            match message {
                CounterMessage::Add { value } => {
                    self.count += value;
                    Ok(ActorAction::Continue)
                }
                CounterMessage::Get { reply } => {
                    let _ = reply.send(self.count);
                    Ok(ActorAction::Continue)
                }
                CounterMessage::Stop => Ok(ActorAction::Stop),
            }
        }

        fn stop(self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_actor_processes_messages_in_order() {
        let handle = ActorHandle::<CounterActor>::new(40);
        let _ = handle.send(CounterMessage::Add { value: 1 }).await;
        let _ = handle.send(CounterMessage::Add { value: 1 }).await;
        let (tx, rx) = oneshot::channel();
        let _ = handle.send(CounterMessage::Get { reply: tx }).await;
        assert_eq!(rx.await, Ok(42));
    }

    #[tokio::test]
    async fn test_actor_handle_wait_for_stop() {
        let handle = ActorHandle::<CounterActor>::new(0);
        let result = handle.send(CounterMessage::Stop).await;
        assert!(matches!(result, Ok(())));

        handle.clone().wait_for_stop().await;
        // Multiple handles should be able to wait for the actor to stop.
        handle.wait_for_stop().await;
    }
}
