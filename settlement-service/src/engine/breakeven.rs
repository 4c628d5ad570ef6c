//! Break-even derivation of the internal house consumption price.
//!
//! The community buys every exported kWh at the PV sale price and settles
//! the residual with the grid. `break_even_price` returns the price at
//! which the money collected from net-importing houses exactly covers both,
//! making the community's interval profit zero.

use super::units::{CentsPerKwh, KilowattHours};

/// Compute the house consumption price for one interval.
///
/// `e_total` is the sum of all net-exporting houses' flows, `i_total` the
/// sum of all net-importing houses' flows. Cases, in order:
///
/// 1. no importers: nothing to settle against, return `fallback`;
/// 2. no exporters: every imported kWh is grid pass-through, return the
///    grid purchase price;
/// 3. community surplus (`e_total >= i_total`): interpolate from the grid
///    delivery price;
/// 4. community deficit: interpolate from the grid purchase price.
///
/// The interpolation weight `e_total / i_total` is the fraction of import
/// demand coverable by internal production; both branches agree at the
/// boundary, where the price equals the PV sale price.
pub fn break_even_price(
    e_total: KilowattHours,
    i_total: KilowattHours,
    p_pv: CentsPerKwh,
    p_grid_del: CentsPerKwh,
    p_grid_con: CentsPerKwh,
    fallback: CentsPerKwh,
) -> CentsPerKwh {
    if i_total.0 <= 0.0 {
        return fallback;
    }
    if e_total.0 <= 0.0 {
        return p_grid_con;
    }

    let p_grid = if e_total.0 >= i_total.0 {
        p_grid_del
    } else {
        p_grid_con
    };

    CentsPerKwh(p_grid.0 + (e_total.0 / i_total.0) * (p_pv.0 - p_grid.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const P_PV: CentsPerKwh = CentsPerKwh(20.0);
    const P_GRID_DEL: CentsPerKwh = CentsPerKwh(6.0);
    const P_GRID_CON: CentsPerKwh = CentsPerKwh(30.0);
    const FALLBACK: CentsPerKwh = CentsPerKwh(25.0);

    fn price(e: f64, i: f64) -> f64 {
        break_even_price(
            KilowattHours(e),
            KilowattHours(i),
            P_PV,
            P_GRID_DEL,
            P_GRID_CON,
            FALLBACK,
        )
        .0
    }

    #[test]
    fn no_imports_returns_fallback() {
        assert_eq!(price(0.0, 0.0), 25.0);
        assert_eq!(price(12.0, 0.0), 25.0);
    }

    #[test]
    fn no_exports_is_grid_pass_through() {
        assert_eq!(price(0.0, 5.0), 30.0);
    }

    #[test]
    fn surplus_interpolation() {
        // 6 + (8/4) * (20 - 6) = 34
        assert!((price(8.0, 4.0) - 34.0).abs() < 1e-9);
    }

    #[test]
    fn deficit_interpolation() {
        // 30 + (4/8) * (20 - 30) = 25
        assert!((price(4.0, 8.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn both_branches_agree_at_the_boundary() {
        // At e == i either branch must collapse to the PV sale price.
        assert!((price(10.0, 10.0) - 20.0).abs() < 1e-9);

        let just_above = price(10.0 + 1e-9, 10.0);
        let just_below = price(10.0 - 1e-9, 10.0);
        assert!((just_above - 20.0).abs() < 1e-6);
        assert!((just_below - 20.0).abs() < 1e-6);
    }
}
