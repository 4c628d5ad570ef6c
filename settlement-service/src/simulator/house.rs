//! One simulated house: PV production, base load, scheduled appliances and
//! an energy meter with ever-increasing import/export registers.

use std::time::Duration;

use community_client::domain::MeterReading;
use rand::{rngs::StdRng, Rng, SeedableRng};
use time::{OffsetDateTime, Time};

use crate::config::{AppliancesConfig, LoadParams, SimHouseEntry};
use crate::engine::units::Kilowatts;
use crate::simulator::solar::pv_production_kw;
use crate::simulator::EvSchedule;

/// Day window for the base load profile: 06:00-22:00.
const DAY_START_HOUR: u8 = 6;
const DAY_END_HOUR: u8 = 22;

/// An appliance with an on/off state and a randomized recurring schedule.
#[derive(Debug, Clone)]
struct Appliance {
    label: &'static str,
    power_kw: f64,
    duration_hours: f64,
    frequency_days: f64,
    /// Inclusive hour window the next run may start in.
    start_window: (u8, u8),
    custom_start_hour: Option<u8>,
    active: bool,
    started_at: Option<OffsetDateTime>,
    next_start: Option<OffsetDateTime>,
}

impl Appliance {
    fn new(
        label: &'static str,
        power_kw: f64,
        duration_hours: f64,
        frequency_days: f64,
        start_window: (u8, u8),
        custom_start_hour: Option<u8>,
    ) -> Self {
        Self {
            label,
            power_kw,
            duration_hours,
            frequency_days,
            start_window,
            custom_start_hour,
            active: false,
            started_at: None,
            next_start: None,
        }
    }

    fn schedule_next(&mut self, now: OffsetDateTime, rng: &mut StdRng) {
        let days_until = rng.gen_range(0.5..self.frequency_days.max(0.51));
        let mut next = now + Duration::from_secs_f64(days_until * 86_400.0);

        let hour = match self.custom_start_hour {
            Some(h) => h.min(23),
            None => {
                let (lo, hi) = self.start_window;
                rng.gen_range(lo..=hi)
            }
        };
        let minute: u8 = rng.gen_range(0..60);
        next = next.replace_time(Time::from_hms(hour, minute, 0).unwrap_or(Time::MIDNIGHT));

        self.next_start = Some(next);
    }

    /// Update the on/off state and return the current draw in kW.
    fn update(&mut self, now: OffsetDateTime, rng: &mut StdRng) -> f64 {
        if self.active {
            if let Some(started) = self.started_at {
                let elapsed_hours = (now - started).as_seconds_f64() / 3600.0;
                if elapsed_hours >= self.duration_hours {
                    self.active = false;
                    self.started_at = None;
                    self.schedule_next(now, rng);
                    tracing::debug!(appliance = self.label, "appliance cycle finished");
                }
            }
        }

        if !self.active {
            if let Some(next) = self.next_start {
                if now >= next {
                    self.active = true;
                    self.started_at = Some(now);
                }
            }
        }

        if self.active {
            self.power_kw
        } else {
            0.0
        }
    }
}

pub struct SimHouse {
    house_id: u32,
    mac: String,
    smid: Option<String>,
    pv_kwp: f64,
    base_day_w: f64,
    base_night_w: f64,
    variation: f64,
    appliances: Vec<Appliance>,
    // Ever-increasing meter registers.
    ei_kwh: f64,
    eo_kwh: f64,
    uptime_s: i64,
    rng: StdRng,
}

impl SimHouse {
    pub fn new(
        entry: &SimHouseEntry,
        load: &LoadParams,
        appliances: &AppliancesConfig,
        fleet_seed: u64,
        start: OffsetDateTime,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(fleet_seed ^ ((entry.house_id as u64) << 17));

        let washing = &appliances.washing_machine;
        let dishwasher = &appliances.dishwasher;
        let mut fleet = vec![
            Appliance::new(
                "washing_machine",
                washing.power_kw,
                washing.duration_hours,
                washing.frequency_days,
                (8, 18),
                None,
            ),
            Appliance::new(
                "dishwasher",
                dishwasher.power_kw,
                dishwasher.duration_hours,
                dishwasher.frequency_days,
                (12, 21),
                None,
            ),
        ];

        if entry.has_ev {
            let ev = &appliances.ev_charger;
            let charge_kwh = entry.ev_charge_kwh.unwrap_or(ev.charge_kwh);
            let frequency_days = entry.ev_frequency_days.unwrap_or(ev.frequency_days);
            let window = match entry.ev_schedule {
                Some(EvSchedule::Night) => (22, 23),
                _ => (8, 14),
            };
            fleet.push(Appliance::new(
                "ev_charger",
                ev.power_kw,
                charge_kwh / ev.power_kw,
                frequency_days,
                window,
                entry.ev_start_hour,
            ));
        }

        for appliance in &mut fleet {
            appliance.schedule_next(start, &mut rng);
        }

        Self {
            house_id: entry.house_id,
            mac: entry.mac.clone(),
            smid: entry.smid.clone(),
            pv_kwp: entry.pv_kwp,
            base_day_w: load.base_day_w,
            base_night_w: load.base_night_w,
            variation: load.variation,
            appliances: fleet,
            ei_kwh: 1000.0,
            eo_kwh: 500.0,
            uptime_s: rng.gen_range(1_000..100_000),
            rng,
        }
    }

    pub fn house_id(&self) -> u32 {
        self.house_id
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    fn base_load_kw(&mut self, now: OffsetDateTime) -> f64 {
        let hour = now.hour();
        let base_w = if (DAY_START_HOUR..DAY_END_HOUR).contains(&hour) {
            self.base_day_w
        } else {
            self.base_night_w
        };

        let factor = if self.variation > 0.0 {
            1.0 + self.rng.gen_range(-self.variation..self.variation)
        } else {
            1.0
        };

        base_w * factor / 1000.0
    }

    /// Advance the house by one interval and emit the meter payload it
    /// would publish: the registers grow by integrated power, exactly one
    /// of `Pi`/`Po` is non-zero.
    pub fn update(&mut self, now: OffsetDateTime, interval: Duration) -> MeterReading {
        let base_load = self.base_load_kw(now);

        let mut appliance_load = 0.0;
        for appliance in &mut self.appliances {
            appliance_load += appliance.update(now, &mut self.rng);
        }

        let pv = pv_production_kw(self.pv_kwp, now, &mut self.rng);

        let net_kw = (base_load + appliance_load) - pv;
        let (pi_kw, po_kw) = if net_kw > 0.0 {
            (net_kw, 0.0)
        } else {
            (0.0, -net_kw)
        };

        self.ei_kwh += Kilowatts(pi_kw).over(interval).0;
        self.eo_kwh += Kilowatts(po_kw).over(interval).0;
        self.uptime_s += interval.as_secs() as i64;

        MeterReading {
            ts: now,
            mac: self.mac.clone(),
            smid: self.smid.clone(),
            pi_kw,
            po_kw,
            ei_kwh: self.ei_kwh,
            eo_kwh: self.eo_kwh,
            uptime_s: self.uptime_s,
        }
    }
}
