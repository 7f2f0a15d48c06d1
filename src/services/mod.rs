pub mod dispatch;
pub mod fare;
pub mod geo_index;
pub mod history;
pub mod locks;
pub mod offers;
pub mod ride_state;
pub mod rides;
pub mod routing;
