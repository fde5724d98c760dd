use async_trait::async_trait;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait CommandSink {
    type Request;
    type Response;

    async fn command(&self, request: Self::Request) -> Self::Response;
}

/// A long-running unit of the payload computer. Every task shares the root
/// cancellation token and returns when it is cancelled.
#[async_trait]
pub trait Task {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

pub type Command<Req, Res> = (Req, oneshot::Sender<anyhow::Result<Res>>);
pub type ChannelCommandSink<Req, Res> = flume::Sender<Command<Req, Res>>;
pub type ChannelCommandSource<Req, Res> = flume::Receiver<Command<Req, Res>>;

/// Creates a bounded request channel whose requests carry their own reply
/// slot.
pub fn command_channel<Req, Res>(
    capacity: usize,
) -> (ChannelCommandSink<Req, Res>, ChannelCommandSource<Req, Res>) {
    flume::bounded(capacity)
}

/// Answers a request, logging instead of failing when the requester has
/// stopped waiting.
pub fn reply<Res>(ret_tx: oneshot::Sender<anyhow::Result<Res>>, result: anyhow::Result<Res>) {
    if ret_tx.send(result).is_err() {
        debug!("command requester went away before the reply");
    }
}

#[async_trait]
impl<Req: Send, Res: Send> CommandSink for ChannelCommandSink<Req, Res> {
    type Request = Req;
    type Response = anyhow::Result<Res>;

    async fn command(&self, request: Self::Request) -> Self::Response {
        let (tx, rx) = oneshot::channel();
        if self.send_async((request, tx)).await.is_err() {
            anyhow::bail!("could not send command");
        }
        rx.await?
    }
}
