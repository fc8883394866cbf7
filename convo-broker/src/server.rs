//! Serve an in-process broker over TCP.
//!
//! Each client socket gets its own broker connection. Requests are executed in arrival order;
//! replies and deliveries share one writer task per socket.

use std::collections::HashMap;
use std::sync::Arc;

use convo_core::broker::{Broker, LocalChannel, LocalConnection};
use convo_core::transport::{Connection, DeliveryCallback, Transport, TransportError};
use convo_core::wire::{encode_frame, read_frame, write_frame, Frame, Op, Reply};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accept connections until the listener fails.
pub async fn run(listener: TcpListener, broker: Arc<Broker>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let broker = broker.clone();
        tokio::spawn(async move {
            match serve_connection(stream, broker).await {
                Ok(()) => tracing::debug!(peer = %peer, "client disconnected"),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "client connection failed"),
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, broker: Arc<Broker>) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                tracing::debug!(error = %e, "client write failed");
                break;
            }
        }
    });

    let conn = broker.connect();
    tracing::debug!(connection = conn.id(), "client connected");
    let mut channels: HashMap<u16, Arc<LocalChannel>> = HashMap::new();
    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(f)) => f,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let Frame::Request { id, channel, op } = frame else {
            tracing::warn!("client sent a non-request frame");
            continue;
        };
        let (result, channel_open) = execute(&conn, &mut channels, channel, op, &tx).await;
        let reply = Frame::Reply {
            id,
            result,
            channel_open,
        };
        let bytes = match encode_frame(&reply) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(id, error = %e, "reply not encodable");
                let failed = Frame::Reply {
                    id,
                    result: Err(e.into()),
                    channel_open,
                };
                match encode_frame(&failed) {
                    Ok(b) => b,
                    Err(e) => break Err(e.into()),
                }
            }
        };
        if tx.send(bytes).is_err() {
            break Ok(());
        }
    };

    // releases exclusive queues and requeues whatever the client left unacked
    let _ = conn.close().await;
    drop(tx);
    let _ = writer_task.await;
    result
}

async fn execute(
    conn: &LocalConnection,
    channels: &mut HashMap<u16, Arc<LocalChannel>>,
    number: u16,
    op: Op,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> (Result<Reply, TransportError>, bool) {
    if op == Op::OpenChannel {
        return match conn.open_local_channel() {
            Ok(ch) => {
                let n = ch.channel_number();
                channels.insert(n, ch);
                (Ok(Reply::Channel(n)), true)
            }
            Err(e) => (Err(e), false),
        };
    }
    let Some(ch) = channels.get(&number).cloned() else {
        return (Err(TransportError::ChannelClosed(number)), false);
    };
    let result = apply(&ch, op, tx).await;
    let open = ch.is_open();
    if !open {
        channels.remove(&number);
    }
    (result, open)
}

async fn apply(
    ch: &LocalChannel,
    op: Op,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> Result<Reply, TransportError> {
    let done = |()| Reply::Done;
    match op {
        Op::OpenChannel => Err(TransportError::Protocol(
            "open-channel sent on an open channel".into(),
        )),
        Op::CloseChannel => ch.close().await.map(done),
        Op::DeclareExchange {
            exchange,
            kind,
            durable,
            auto_delete,
        } => ch
            .declare_exchange(&exchange, kind, durable, auto_delete)
            .await
            .map(done),
        Op::DeleteExchange { exchange } => ch.delete_exchange(&exchange).await.map(done),
        Op::DeclareQueue { queue, options } => {
            ch.declare_queue(&queue, options).await.map(Reply::Queue)
        }
        Op::DeleteQueue { queue } => ch.delete_queue(&queue).await.map(done),
        Op::Bind {
            exchange,
            queue,
            binding,
        } => ch.bind(&exchange, &queue, &binding).await.map(done),
        Op::Unbind {
            exchange,
            queue,
            binding,
        } => ch.unbind(&exchange, &queue, &binding).await.map(done),
        Op::Publish {
            exchange,
            routing_key,
            body,
            headers,
            options,
        } => ch
            .publish(&exchange, &routing_key, body, headers, options)
            .await
            .map(done),
        Op::Consume {
            consumer,
            queue,
            no_ack,
            exclusive,
        } => {
            let tx = tx.clone();
            let callback: DeliveryCallback = Arc::new(move |delivery| {
                let tag = delivery.delivery_tag;
                match encode_frame(&Frame::Deliver { consumer, delivery }) {
                    Ok(bytes) => {
                        let _ = tx.send(bytes);
                    }
                    // stays unacked; requeued when the client goes away
                    Err(e) => tracing::warn!(consumer, tag, error = %e, "delivery not encodable, dropped"),
                }
            });
            ch.start_consume(callback, &queue, no_ack, exclusive)
                .await
                .map(Reply::ConsumerTag)
        }
        Op::Cancel { consumer_tag } => ch.cancel_consumer(&consumer_tag).await.map(done),
        Op::ConsumerActive { consumer_tag } => {
            ch.consumer_active(&consumer_tag).await.map(Reply::Active)
        }
        Op::Ack { delivery_tag } => ch.ack(delivery_tag).await.map(done),
        Op::Reject {
            delivery_tag,
            requeue,
        } => ch.reject(delivery_tag, requeue).await.map(done),
        Op::QueueStats { queue } => ch.queue_stats(&queue).await.map(Reply::Stats),
        Op::Purge { queue } => ch.purge(&queue).await.map(Reply::Purged),
    }
}
