use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Vehicle category; drives both matching eligibility and fare rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    #[sea_orm(string_value = "economy")]
    Economy,
    #[sea_orm(string_value = "comfort")]
    Comfort,
    #[sea_orm(string_value = "xl")]
    Xl,
    #[sea_orm(string_value = "bike")]
    Bike,
}

impl std::fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VehicleClass::Economy => "economy",
            VehicleClass::Comfort => "comfort",
            VehicleClass::Xl => "xl",
            VehicleClass::Bike => "bike",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "drivers")]
pub struct Model {
    /// Same id as the driver's user account.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub vehicle_class: VehicleClass,
    pub rating: f64,
    pub is_online: bool,
    pub is_available: bool,
    pub current_lat: Option<f64>,
    pub current_lng: Option<f64>,
    pub heading: Option<f64>,
    pub location_updated_at: Option<DateTimeWithTimeZone>,
    pub current_ride_id: Option<Uuid>,
    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn new(id: Uuid, vehicle_class: VehicleClass) -> Self {
        Self {
            id,
            vehicle_class,
            rating: 5.0,
            is_online: false,
            is_available: false,
            current_lat: None,
            current_lng: None,
            heading: None,
            location_updated_at: None,
            current_ride_id: None,
            created_at: chrono::Utc::now().into(),
        }
    }

    pub fn last_known_location(&self) -> Option<crate::utils::geo::Coordinates> {
        match (self.current_lat, self.current_lng) {
            (Some(lat), Some(lng)) => Some(crate::utils::geo::Coordinates { lat, lng }),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::Id",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
