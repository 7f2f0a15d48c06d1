//! Spatial index of online drivers.
//!
//! Drivers are bucketed into a uniform latitude/longitude grid whose cell
//! edge is configured in kilometres. A radius query only visits the cells
//! covering the radius' bounding box, then ranks survivors by great-circle
//! distance. The grid and the entry table live behind one `RwLock`: a query
//! sees a consistent snapshot, a write is an O(1) cell move.
//!
//! One lock means location pings serialize with each other and briefly
//! block readers. Writers hold it for a hash-map move only, and a query
//! holds the read side for the cells it scans, so contention stays
//! proportional to ping rate rather than fleet size. Sharding by cell
//! would need a multi-shard read for radius queries spanning cell edges
//! and a two-shard write for drivers crossing one; revisit if ping
//! handling shows up in lock wait time.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::GeoConfig;
use crate::entities::driver::VehicleClass;
use crate::error::{AppError, AppResult};
use crate::utils::geo::{Coordinates, EARTH_RADIUS_KM};

/// Great-circle kilometres per degree of arc, consistent with the haversine radius.
const KM_PER_ARC_DEGREE: f64 = std::f64::consts::PI * EARTH_RADIUS_KM / 180.0;

type CellKey = (i64, i64);

#[derive(Debug, Clone, Copy)]
pub struct DriverPosition {
    pub driver_id: Uuid,
    pub location: Coordinates,
    pub vehicle_class: VehicleClass,
    pub available: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NearbyDriver {
    pub driver_id: Uuid,
    pub distance_km: f64,
    pub location: Coordinates,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    location: Coordinates,
    vehicle_class: VehicleClass,
    available: bool,
    recorded_at: DateTime<Utc>,
    cell: CellKey,
    touched_at: Instant,
}

#[derive(Default)]
struct GridState {
    cells: HashMap<CellKey, HashSet<Uuid>>,
    entries: HashMap<Uuid, Entry>,
}

impl GridState {
    fn detach(&mut self, driver_id: Uuid, cell: CellKey) {
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.remove(&driver_id);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    fn remove(&mut self, driver_id: Uuid) -> Option<Entry> {
        let entry = self.entries.remove(&driver_id)?;
        self.detach(driver_id, entry.cell);
        Some(entry)
    }
}

pub struct GeoIndex {
    cell_deg: f64,
    lon_cells: i64,
    stale_after: Duration,
    state: RwLock<GridState>,
}

impl GeoIndex {
    pub fn new(config: &GeoConfig) -> Self {
        let cell_deg = (config.cell_size_km / KM_PER_ARC_DEGREE).clamp(1e-4, 90.0);
        Self {
            cell_deg,
            lon_cells: (360.0 / cell_deg).ceil() as i64,
            stale_after: config.stale_after,
            state: RwLock::new(GridState::default()),
        }
    }

    fn lat_index(&self, lat: f64) -> i64 {
        ((lat + 90.0) / self.cell_deg).floor() as i64
    }

    fn lon_index(&self, lng: f64) -> i64 {
        (((lng + 180.0) / self.cell_deg).floor() as i64).rem_euclid(self.lon_cells)
    }

    fn cell_of(&self, location: &Coordinates) -> CellKey {
        (self.lat_index(location.lat), self.lon_index(location.lng))
    }

    fn is_stale(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.touched_at) > self.stale_after
    }

    /// Insert or replace a driver's entry. A position older than the one
    /// already indexed is ignored and `Ok(false)` is returned.
    pub fn upsert(&self, position: DriverPosition) -> AppResult<bool> {
        position.location.validate()?;
        let cell = self.cell_of(&position.location);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = state.entries.get(&position.driver_id).copied() {
            if position.recorded_at < existing.recorded_at {
                return Ok(false);
            }
            if existing.cell != cell {
                state.detach(position.driver_id, existing.cell);
            }
        }

        state.cells.entry(cell).or_default().insert(position.driver_id);
        state.entries.insert(
            position.driver_id,
            Entry {
                location: position.location,
                vehicle_class: position.vehicle_class,
                available: position.available,
                recorded_at: position.recorded_at,
                cell,
                touched_at: Instant::now(),
            },
        );
        Ok(true)
    }

    /// Move an already-indexed driver. Returns `Ok(false)` when the driver is
    /// not indexed (offline) or the ping is older than the stored one.
    pub fn update_location(
        &self,
        driver_id: Uuid,
        location: Coordinates,
        recorded_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        location.validate()?;
        let cell = self.cell_of(&location);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let Some(existing) = state.entries.get(&driver_id).copied() else {
            return Ok(false);
        };
        if recorded_at < existing.recorded_at {
            return Ok(false);
        }
        if existing.cell != cell {
            state.detach(driver_id, existing.cell);
            state.cells.entry(cell).or_default().insert(driver_id);
        }
        state.entries.insert(
            driver_id,
            Entry {
                location,
                recorded_at,
                cell,
                touched_at: Instant::now(),
                ..existing
            },
        );
        Ok(true)
    }

    pub fn remove(&self, driver_id: Uuid) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.remove(driver_id).is_some()
    }

    pub fn set_available(&self, driver_id: Uuid, available: bool) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.entries.get_mut(&driver_id) {
            Some(entry) => {
                entry.available = available;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, driver_id: Uuid) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.contains_key(&driver_id)
    }

    pub fn location_of(&self, driver_id: Uuid) -> Option<Coordinates> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(&driver_id).map(|e| e.location)
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Available drivers of `vehicle_class` within `radius_km`, nearest first.
    pub fn query_nearby(
        &self,
        center: Coordinates,
        radius_km: f64,
        vehicle_class: VehicleClass,
        limit: usize,
    ) -> AppResult<Vec<NearbyDriver>> {
        self.query_nearby_at(center, radius_km, vehicle_class, limit, Instant::now())
    }

    fn query_nearby_at(
        &self,
        center: Coordinates,
        radius_km: f64,
        vehicle_class: VehicleClass,
        limit: usize,
        now: Instant,
    ) -> AppResult<Vec<NearbyDriver>> {
        center.validate()?;
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(AppError::InvalidInput(format!(
                "radius must be a non-negative number, got {}",
                radius_km
            )));
        }

        let mut found = Vec::new();
        let mut stale = Vec::new();
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            for cell in self.covering_cells(&center, radius_km) {
                let Some(bucket) = state.cells.get(&cell) else {
                    continue;
                };
                for driver_id in bucket {
                    let Some(entry) = state.entries.get(driver_id) else {
                        continue;
                    };
                    if self.is_stale(entry, now) {
                        stale.push(*driver_id);
                        continue;
                    }
                    if !entry.available || entry.vehicle_class != vehicle_class {
                        continue;
                    }
                    let distance_km = center.distance_km(&entry.location);
                    if distance_km <= radius_km {
                        found.push(NearbyDriver {
                            driver_id: *driver_id,
                            distance_km,
                            location: entry.location,
                        });
                    }
                }
            }
        }

        if !stale.is_empty() {
            self.evict(&stale, now);
        }

        found.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        found.truncate(limit);
        Ok(found)
    }

    fn evict(&self, candidates: &[Uuid], now: Instant) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = 0;
        for driver_id in candidates {
            // Re-check: the driver may have pinged since the read lock was released.
            let still_stale = state
                .entries
                .get(driver_id)
                .is_some_and(|entry| self.is_stale(entry, now));
            if still_stale && state.remove(*driver_id).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted stale drivers from geo index");
        }
        evicted
    }

    /// Drop every entry that has not been refreshed within the stale window.
    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(Instant::now())
    }

    fn evict_stale_at(&self, now: Instant) -> usize {
        let candidates: Vec<Uuid> = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state
                .entries
                .iter()
                .filter(|(_, entry)| self.is_stale(entry, now))
                .map(|(id, _)| *id)
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }
        self.evict(&candidates, now)
    }

    /// Cells whose union covers every point within `radius_km` of `center`,
    /// padded by one cell on each side.
    fn covering_cells(&self, center: &Coordinates, radius_km: f64) -> Vec<CellKey> {
        let lat_span = radius_km / KM_PER_ARC_DEGREE;
        let lat_lo = self.lat_index((center.lat - lat_span).max(-90.0)) - 1;
        let lat_hi = self.lat_index((center.lat + lat_span).min(90.0)) + 1;

        let extreme_lat = (center.lat.abs() + lat_span).min(90.0);
        let cos_lat = extreme_lat.to_radians().cos();
        let lon_range: Vec<i64> = if cos_lat < 1e-6 {
            (0..self.lon_cells).collect()
        } else {
            let lon_span = lat_span / cos_lat;
            let lo = ((center.lng - lon_span + 180.0) / self.cell_deg).floor() as i64 - 1;
            let hi = ((center.lng + lon_span + 180.0) / self.cell_deg).floor() as i64 + 1;
            if hi - lo + 1 >= self.lon_cells {
                (0..self.lon_cells).collect()
            } else {
                (lo..=hi).map(|i| i.rem_euclid(self.lon_cells)).collect()
            }
        };

        let mut cells = Vec::with_capacity(((lat_hi - lat_lo + 1) as usize) * lon_range.len());
        for lat_idx in lat_lo..=lat_hi {
            for lon_idx in &lon_range {
                cells.push((lat_idx, *lon_idx));
            }
        }
        cells
    }
}
