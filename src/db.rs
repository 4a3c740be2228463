use log::info;
use mongodb::{
    bson::doc,
    options::{ClientOptions, IndexOptions},
    Client, Collection, Database, IndexModel,
};

use crate::models::{
    contract::Contract, conversation::Conversation, conversation::Message, dispute::Dispute,
    hire_request::HireNowRequest, notification::Notification, project::Project,
    proposal::Proposal, review::Review, settings::PlatformSettings, support_ticket::SupportTicket,
    transaction::Transaction, user::User,
};

pub struct MongoDB {
    pub db: Database,
}

impl MongoDB {
    pub async fn init(uri: &str, db_name: &str) -> mongodb::error::Result<Self> {
        let client_options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(client_options)?;
        let mongodb = MongoDB { db: client.database(db_name) };
        mongodb.ensure_indexes().await?;
        Ok(mongodb)
    }

    async fn ensure_indexes(&self) -> mongodb::error::Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.users()
            .create_index(IndexModel::builder().keys(doc! { "email": 1 }).options(unique()).build())
            .await?;
        self.users()
            .create_index(
                IndexModel::builder().keys(doc! { "profile_slug": 1 }).options(unique()).build(),
            )
            .await?;
        self.proposals()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "project_id": 1, "freelancer_id": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.reviews()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "contract_id": 1, "reviewer_id": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.transactions()
            .create_index(IndexModel::builder().keys(doc! { "status": 1, "escrow_release_date": 1 }).build())
            .await?;
        self.notifications()
            .create_index(IndexModel::builder().keys(doc! { "user_id": 1, "created_at": -1 }).build())
            .await?;

        info!("MongoDB indexes ensured");
        Ok(())
    }

    pub fn users(&self) -> Collection<User> {
        self.db.collection("users")
    }

    pub fn projects(&self) -> Collection<Project> {
        self.db.collection("projects")
    }

    pub fn proposals(&self) -> Collection<Proposal> {
        self.db.collection("proposals")
    }

    pub fn contracts(&self) -> Collection<Contract> {
        self.db.collection("contracts")
    }

    pub fn transactions(&self) -> Collection<Transaction> {
        self.db.collection("transactions")
    }

    pub fn reviews(&self) -> Collection<Review> {
        self.db.collection("reviews")
    }

    pub fn disputes(&self) -> Collection<Dispute> {
        self.db.collection("disputes")
    }

    pub fn notifications(&self) -> Collection<Notification> {
        self.db.collection("notifications")
    }

    pub fn conversations(&self) -> Collection<Conversation> {
        self.db.collection("conversations")
    }

    pub fn messages(&self) -> Collection<Message> {
        self.db.collection("messages")
    }

    pub fn hire_requests(&self) -> Collection<HireNowRequest> {
        self.db.collection("hire_now_requests")
    }

    pub fn support_tickets(&self) -> Collection<SupportTicket> {
        self.db.collection("support_tickets")
    }

    pub fn settings(&self) -> Collection<PlatformSettings> {
        self.db.collection("settings")
    }
}
