use std::sync::Arc;

use actix::Addr;

use crate::config::Config;
use crate::db::MongoDB;
use crate::notification_hub::NotificationHub;
use crate::stripe::StripeClient;

#[derive(Clone)]
pub struct AppState {
    pub notification_hub: Addr<NotificationHub>,
    pub mongodb: Arc<MongoDB>,
    pub stripe: Arc<StripeClient>,
    pub config: Config,
}
