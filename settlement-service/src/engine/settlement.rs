//! The multi-tier settlement ledger.
//!
//! One call prices one interval: each house's import/export deltas are
//! netted into a single signed flow, the flow is priced against the tariff
//! snapshot, and the community's residual is settled with the grid. With a
//! derived house consumption price the community's profit is zero by
//! construction whenever both importers and exporters exist.

use std::collections::BTreeMap;

use community_client::domain::{CommunityEnergyRecord, HouseEnergyRecord};
use time::OffsetDateTime;

use super::breakeven::break_even_price;
use super::tariff::TariffSnapshot;
use super::units::{Cents, CentsPerKwh, KilowattHours};
use super::PendingHouse;

/// The settled records for one interval plus the aggregate volumes the
/// price was derived from.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub houses: Vec<HouseEnergyRecord>,
    pub community: CommunityEnergyRecord,
    /// House consumption price applied this interval (configured or
    /// break-even derived), ct/kWh.
    pub effective_p_con: f64,
    /// Sum of net-exporting houses' flows (kWh).
    pub exported_total_kwh: f64,
    /// Sum of net-importing houses' flows (kWh).
    pub imported_total_kwh: f64,
}

/// Price one interval's accumulated deltas.
pub fn settle(
    ts: OffsetDateTime,
    pending: &BTreeMap<u32, PendingHouse>,
    tariff: &TariffSnapshot,
) -> Settlement {
    let p_pv = CentsPerKwh(tariff.rates.p_pv);
    let p_grid_del = CentsPerKwh(tariff.rates.p_grid_del);
    let p_grid_con = CentsPerKwh(tariff.rates.p_grid_con);

    // First pass: aggregate volumes. The internal price depends on the
    // whole interval, so it must be known before any house is priced.
    let mut e_total = KilowattHours(0.0);
    let mut i_total = KilowattHours(0.0);
    let mut total_consumption = KilowattHours(0.0);
    let mut total_production = KilowattHours(0.0);

    for house in pending.values() {
        let net = KilowattHours(house.delta.net_kwh());
        e_total += net.clamp_non_negative();
        i_total += KilowattHours(-net.0).clamp_non_negative();
        total_consumption += KilowattHours(house.delta.ei_kwh);
        total_production += KilowattHours(house.delta.eo_kwh);
    }

    let p_con = match tariff.rates.p_con {
        Some(configured) => CentsPerKwh(configured),
        None => break_even_price(
            e_total,
            i_total,
            p_pv,
            p_grid_del,
            p_grid_con,
            CentsPerKwh(tariff.default_p_con),
        ),
    };

    // Second pass: price each house's netted flow. A net exporter sells to
    // the community at the PV rate; a net importer (or a balanced house)
    // buys from the community at the house rate. The community's matching
    // leg mirrors the same volume and price.
    let mut community_sell = Cents(0.0);
    let mut community_buy = Cents(0.0);
    let mut houses = Vec::with_capacity(pending.len());

    for house in pending.values() {
        let net = KilowattHours(house.delta.net_kwh());

        let (value_consumption, value_pv_delivery) = if net.0 > 0.0 {
            let sold = net * p_pv;
            community_buy += sold;
            (Cents(0.0), sold)
        } else {
            let bought = KilowattHours(-net.0) * p_con;
            community_sell += bought;
            (bought, Cents(0.0))
        };

        houses.push(HouseEnergyRecord {
            ts,
            house_id: house.house_id.to_string(),
            mac: house.mac.clone(),
            delta_ei_kwh: house.delta.ei_kwh,
            delta_eo_kwh: house.delta.eo_kwh,
            net_flow_kwh: net.0,
            value_consumption_ct: value_consumption.0,
            value_pv_delivery_ct: value_pv_delivery.0,
            tariff_p_con: p_con.0,
            tariff_p_pv: p_pv.0,
        });
    }

    // Grid leg: the community's residual is exchanged with the grid at the
    // grid tariffs.
    let net_community = KilowattHours(e_total.0 - i_total.0);
    let (grid_import, grid_export, value_grid_import, value_grid_export) = if net_community.0 > 0.0
    {
        let earned = net_community * p_grid_del;
        community_sell += earned;
        (KilowattHours(0.0), net_community, Cents(0.0), earned)
    } else {
        let imported = KilowattHours(-net_community.0);
        let paid = imported * p_grid_con;
        community_buy += paid;
        (imported, KilowattHours(0.0), paid, Cents(0.0))
    };

    let community = CommunityEnergyRecord {
        ts,
        total_consumption_kwh: total_consumption.0,
        total_production_kwh: total_production.0,
        net_community_kwh: net_community.0,
        grid_import_kwh: grid_import.0,
        grid_export_kwh: grid_export.0,
        value_grid_import_ct: value_grid_import.0,
        value_grid_export_ct: value_grid_export.0,
        community_profit_ct: community_sell.0 - community_buy.0,
        tariff_p_grid_con: p_grid_con.0,
        tariff_p_grid_del: p_grid_del.0,
        tariff_p_con: p_con.0,
    };

    Settlement {
        houses,
        community,
        effective_p_con: p_con.0,
        exported_total_kwh: e_total.0,
        imported_total_kwh: i_total.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::counter_store::IntervalDelta;
    use crate::engine::tariff::TariffRates;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use time::macros::datetime;

    const TS: OffsetDateTime = datetime!(2025-07-15 12:00:00 UTC);

    fn snapshot(p_con: Option<f64>) -> TariffSnapshot {
        TariffSnapshot {
            rates: TariffRates {
                p_pv: 20.0,
                p_grid_del: 6.0,
                p_grid_con: 30.0,
                p_con,
            },
            default_p_con: 25.0,
        }
    }

    fn pending(entries: &[(u32, f64, f64)]) -> BTreeMap<u32, PendingHouse> {
        entries
            .iter()
            .map(|&(house_id, ei, eo)| {
                (
                    house_id,
                    PendingHouse {
                        house_id,
                        mac: format!("AA-11-BB-22-CC-{house_id:02}"),
                        delta: IntervalDelta {
                            ei_kwh: ei,
                            eo_kwh: eo,
                        },
                    },
                )
            })
            .collect()
    }

    #[test]
    fn net_flows_are_conserved() {
        let deltas = pending(&[(1, 0.5, 2.0), (2, 1.0, 0.0), (3, 0.3, 0.3)]);
        let s = settle(TS, &deltas, &snapshot(None));

        let house_net: f64 = s.houses.iter().map(|h| h.net_flow_kwh).sum();
        assert!((house_net - s.community.net_community_kwh).abs() < 1e-6);
        assert!(
            (s.community.net_community_kwh - (s.exported_total_kwh - s.imported_total_kwh)).abs()
                < 1e-6
        );
    }

    #[test]
    fn each_house_settles_exactly_one_leg() {
        // Both raw deltas non-zero: the house is netted before pricing.
        let deltas = pending(&[(1, 0.5, 2.0), (2, 2.0, 0.5)]);
        let s = settle(TS, &deltas, &snapshot(None));

        let exporter = &s.houses[0];
        assert!((exporter.net_flow_kwh - 1.5).abs() < 1e-9);
        assert_eq!(exporter.value_consumption_ct, 0.0);
        assert!((exporter.value_pv_delivery_ct - 1.5 * 20.0).abs() < 1e-9);

        let importer = &s.houses[1];
        assert!((importer.net_flow_kwh + 1.5).abs() < 1e-9);
        assert_eq!(importer.value_pv_delivery_ct, 0.0);
        assert!((importer.value_consumption_ct - 1.5 * importer.tariff_p_con).abs() < 1e-9);
    }

    #[test]
    fn balanced_house_is_settled_as_importer_with_zero_value() {
        let deltas = pending(&[(1, 0.4, 0.4)]);
        let s = settle(TS, &deltas, &snapshot(None));

        assert_eq!(s.houses[0].net_flow_kwh, 0.0);
        assert_eq!(s.houses[0].value_consumption_ct, 0.0);
        assert_eq!(s.houses[0].value_pv_delivery_ct, 0.0);
    }

    #[test]
    fn surplus_interval_exports_residual_to_grid() {
        let deltas = pending(&[(1, 0.0, 3.0), (2, 1.0, 0.0)]);
        let s = settle(TS, &deltas, &snapshot(None));

        assert!((s.community.grid_export_kwh - 2.0).abs() < 1e-9);
        assert_eq!(s.community.grid_import_kwh, 0.0);
        assert!((s.community.value_grid_export_ct - 2.0 * 6.0).abs() < 1e-9);
        assert_eq!(s.community.value_grid_import_ct, 0.0);
    }

    #[test]
    fn deficit_interval_imports_residual_from_grid() {
        let deltas = pending(&[(1, 0.0, 1.0), (2, 3.0, 0.0)]);
        let s = settle(TS, &deltas, &snapshot(None));

        assert!((s.community.grid_import_kwh - 2.0).abs() < 1e-9);
        assert_eq!(s.community.grid_export_kwh, 0.0);
        assert!((s.community.value_grid_import_ct - 2.0 * 30.0).abs() < 1e-9);
    }

    #[test]
    fn configured_p_con_overrides_the_derivation() {
        let deltas = pending(&[(1, 2.0, 0.0), (2, 0.0, 1.0)]);
        let s = settle(TS, &deltas, &snapshot(Some(40.0)));

        assert_eq!(s.effective_p_con, 40.0);
        assert!((s.houses[0].value_consumption_ct - 2.0 * 40.0).abs() < 1e-9);
    }

    #[test]
    fn community_profit_is_zero_at_the_break_even_price() {
        // Random mixes of importers and exporters under random tariffs: as
        // long as both sides are present, the derived price balances the
        // books to rounding.
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            let tariff = TariffSnapshot {
                rates: TariffRates {
                    p_pv: rng.gen_range(1.0..50.0),
                    p_grid_del: rng.gen_range(1.0..50.0),
                    p_grid_con: rng.gen_range(1.0..50.0),
                    p_con: None,
                },
                default_p_con: 25.0,
            };

            let house_count = rng.gen_range(2..9);
            let entries: Vec<(u32, f64, f64)> = (0..house_count)
                .map(|id| (id, rng.gen_range(0.0..5.0), rng.gen_range(0.0..5.0)))
                .collect();

            let deltas = pending(&entries);
            let s = settle(TS, &deltas, &tariff);

            if s.exported_total_kwh > 0.0 && s.imported_total_kwh > 0.0 {
                assert!(
                    s.community.community_profit_ct.abs() < 1e-6,
                    "profit {} ct not balanced for e={} i={}",
                    s.community.community_profit_ct,
                    s.exported_total_kwh,
                    s.imported_total_kwh
                );
            }
        }
    }

    #[test]
    fn empty_interval_settles_to_zeros() {
        let s = settle(TS, &BTreeMap::new(), &snapshot(None));
        assert!(s.houses.is_empty());
        assert_eq!(s.community.total_consumption_kwh, 0.0);
        assert_eq!(s.community.community_profit_ct, 0.0);
        // No importers: the fallback price is reported.
        assert_eq!(s.effective_p_con, 25.0);
    }
}
