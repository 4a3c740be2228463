use std::collections::HashMap;

use actix::prelude::*;
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;

/// Text frame handed to one WebSocket session.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Push(pub String);

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub user_id: String,
    pub addr: Recipient<Push>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub user_id: String,
    pub addr: Recipient<Push>,
}

/// Fan an event out to every live session of each listed user.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver {
    pub user_ids: Vec<String>,
    pub event: String,
    pub payload: Value,
}

impl Deliver {
    pub fn to(user_id: impl Into<String>, event: &str, payload: impl Serialize) -> Self {
        Deliver {
            user_ids: vec![user_id.into()],
            event: event.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct SessionCount {
    pub user_id: String,
}

#[derive(Serialize)]
struct Frame<'a> {
    event: &'a str,
    payload: &'a Value,
}

/// Tracks connected sessions. A user may hold several (tabs, devices).
/// Delivery is best-effort: offline users just miss the push and read the
/// stored notification later.
#[derive(Default)]
pub struct NotificationHub {
    sessions: HashMap<String, Vec<Recipient<Push>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actor for NotificationHub {
    type Context = Context<Self>;
}

impl Handler<Connect> for NotificationHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) {
        info!("User {} connected (WS)", msg.user_id);
        self.sessions.entry(msg.user_id).or_default().push(msg.addr);
    }
}

impl Handler<Disconnect> for NotificationHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) {
        info!("User {} disconnected (WS)", msg.user_id);
        if let Some(addrs) = self.sessions.get_mut(&msg.user_id) {
            addrs.retain(|a| a != &msg.addr);
            if addrs.is_empty() {
                self.sessions.remove(&msg.user_id);
            }
        }
    }
}

impl Handler<Deliver> for NotificationHub {
    type Result = ();

    fn handle(&mut self, msg: Deliver, _: &mut Context<Self>) {
        let text = match serde_json::to_string(&Frame { event: &msg.event, payload: &msg.payload }) {
            Ok(t) => t,
            Err(_) => return,
        };
        for user_id in &msg.user_ids {
            if let Some(addrs) = self.sessions.get(user_id) {
                debug!("Pushing {} to {} session(s) of {}", msg.event, addrs.len(), user_id);
                for addr in addrs {
                    addr.do_send(Push(text.clone()));
                }
            }
        }
    }
}

impl Handler<SessionCount> for NotificationHub {
    type Result = usize;

    fn handle(&mut self, msg: SessionCount, _: &mut Context<Self>) -> usize {
        self.sessions.get(&msg.user_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collector {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Push> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Push, _: &mut Context<Self>) {
            self.seen.lock().unwrap().push(msg.0);
        }
    }

    #[derive(Message)]
    #[rtype(result = "()")]
    struct Flush;

    impl Handler<Flush> for Collector {
        type Result = ();

        fn handle(&mut self, _: Flush, _: &mut Context<Self>) {}
    }

    #[actix_web::test]
    async fn pushes_reach_every_session_of_the_target_only() {
        let hub = NotificationHub::new().start();
        let a_seen = Arc::new(Mutex::new(Vec::new()));
        let b_seen = Arc::new(Mutex::new(Vec::new()));
        let a1 = Collector { seen: a_seen.clone() }.start();
        let a2 = Collector { seen: a_seen.clone() }.start();
        let b = Collector { seen: b_seen.clone() }.start();

        hub.send(Connect { user_id: "alice".into(), addr: a1.clone().recipient() }).await.unwrap();
        hub.send(Connect { user_id: "alice".into(), addr: a2.clone().recipient() }).await.unwrap();
        hub.send(Connect { user_id: "bob".into(), addr: b.clone().recipient() }).await.unwrap();
        assert_eq!(hub.send(SessionCount { user_id: "alice".into() }).await.unwrap(), 2);

        hub.send(Deliver::to("alice", "notification:new", serde_json::json!({ "title": "hi" })))
            .await
            .unwrap();
        a1.send(Flush).await.unwrap();
        a2.send(Flush).await.unwrap();
        b.send(Flush).await.unwrap();

        let seen = a_seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        let frame: Value = serde_json::from_str(&seen[0]).unwrap();
        assert_eq!(frame["event"], "notification:new");
        assert_eq!(frame["payload"]["title"], "hi");
        assert!(b_seen.lock().unwrap().is_empty());

        hub.send(Disconnect { user_id: "alice".into(), addr: a1.recipient() }).await.unwrap();
        assert_eq!(hub.send(SessionCount { user_id: "alice".into() }).await.unwrap(), 1);
    }
}
