use crate::quota::NotifyState;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "quota_state")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub sim_id: i64,
    pub last_alert_time: i64,
    pub last_monthly_notify_time: i64,
    pub last_daily_notify_time: i64,
    pub limit_armed: bool,
    pub monthly_mark_armed: bool,
    pub daily_mark_armed: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for NotifyState {
    fn from(model: Model) -> Self {
        Self {
            sim_id: model.sim_id as u32,
            last_alert_time: model.last_alert_time.max(0) as u64,
            last_monthly_notify_time: model.last_monthly_notify_time.max(0) as u64,
            last_daily_notify_time: model.last_daily_notify_time.max(0) as u64,
            limit_armed: model.limit_armed,
            monthly_mark_armed: model.monthly_mark_armed,
            daily_mark_armed: model.daily_mark_armed,
        }
    }
}
