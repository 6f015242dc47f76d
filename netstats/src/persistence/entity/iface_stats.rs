use crate::model::TrafficSample;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "iface_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub iface: String,
    pub ident: String,
    pub date: i64,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&TrafficSample> for ActiveModel {
    fn from(row: &TrafficSample) -> Self {
        Self {
            id: NotSet,
            iface: Set(row.iface.clone()),
            ident: Set(row.ident.clone()),
            date: Set(super::to_db(row.date)),
            rx_bytes: Set(super::to_db(row.rx_bytes)),
            rx_packets: Set(super::to_db(row.rx_packets)),
            tx_bytes: Set(super::to_db(row.tx_bytes)),
            tx_packets: Set(super::to_db(row.tx_packets)),
        }
    }
}

impl From<Model> for TrafficSample {
    fn from(model: Model) -> Self {
        TrafficSample::new(0, model.iface, model.ident, model.date.max(0) as u64)
            .with_bytes(model.rx_bytes.max(0) as u64, model.tx_bytes.max(0) as u64)
            .with_packets(model.rx_packets.max(0) as u64, model.tx_packets.max(0) as u64)
    }
}
