use crate::model::{ClassificationFlag, TrafficSample, USER_ID_DIVISOR};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "uid_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub uid: i64,
    pub iface: String,
    pub ident: String,
    pub date: i64,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub flag: i32,
    pub user_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&TrafficSample> for ActiveModel {
    fn from(row: &TrafficSample) -> Self {
        Self {
            id: NotSet,
            uid: Set(i64::from(row.uid)),
            iface: Set(row.iface.clone()),
            ident: Set(row.ident.clone()),
            date: Set(super::to_db(row.date)),
            rx_bytes: Set(super::to_db(row.rx_bytes)),
            rx_packets: Set(super::to_db(row.rx_packets)),
            tx_bytes: Set(super::to_db(row.tx_bytes)),
            tx_packets: Set(super::to_db(row.tx_packets)),
            flag: Set(row.flag.as_i32()),
            user_id: Set(i64::from(row.user_id)),
        }
    }
}

impl From<Model> for TrafficSample {
    fn from(model: Model) -> Self {
        let uid = model.uid.max(0) as u32;
        Self {
            uid,
            iface: model.iface,
            ident: model.ident,
            date: model.date.max(0) as u64,
            rx_bytes: model.rx_bytes.max(0) as u64,
            tx_bytes: model.tx_bytes.max(0) as u64,
            rx_packets: model.rx_packets.max(0) as u64,
            tx_packets: model.tx_packets.max(0) as u64,
            flag: ClassificationFlag::from_i32(model.flag),
            user_id: uid / USER_ID_DIVISOR,
        }
    }
}
