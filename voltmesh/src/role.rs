//! Role management for the charging coordination layer.
//!
//! Evaluated every tick; a node exposes exactly one role at any tick
//! boundary. A switch replaces the active handler atomically and the node
//! cancels pending sessions belonging to the departed role.

use tracing::info;

use crate::context::Context;
use crate::types::NodeRole;

/// Inputs the role decision needs from the other layers.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoleInputs {
    /// This node is currently a platoon member (not head).
    pub in_platoon_as_member: bool,
    /// A consumer-side session is pending or booked.
    pub consumer_session_active: bool,
}

/// Decide the role the local state warrants right now.
///
/// RREHs never change. Platoon members stay members while their platoon
/// lives. A vehicle with enough battery and willingness becomes a platoon
/// head unless a consumer session is in flight; one with a charging need
/// becomes a consumer; a provider-capable vehicle with surplus but below
/// the PH bar announces as a plain mobile provider.
pub fn evaluate(ctx: &Context, inputs: RoleInputs) -> NodeRole {
    let state = &ctx.state;
    let config = &ctx.config;

    if state.role == NodeRole::Rreh {
        return NodeRole::Rreh;
    }
    if inputs.in_platoon_as_member {
        return NodeRole::PlatoonMember;
    }
    if state.needs_charge(config) {
        return NodeRole::Consumer;
    }

    let can_head = state.battery_pct() >= config.ph_energy_threshold_percent
        && state.willingness >= config.ph_willingness_threshold
        && !inputs.consumer_session_active;
    if can_head {
        return NodeRole::PlatoonHead;
    }

    if state.provider_capable && state.shareable_energy(config) > 0.0 {
        return NodeRole::MobileProvider;
    }

    NodeRole::Consumer
}

/// Apply the evaluated role. Returns `Some((old, new))` when it changed;
/// the caller cancels the departed role's pending sessions.
pub fn tick(ctx: &mut Context, inputs: RoleInputs) -> Option<(NodeRole, NodeRole)> {
    let old = ctx.state.role;
    let new = evaluate(ctx, inputs);
    if new == old {
        return None;
    }
    ctx.state.role = new;
    info!(?old, ?new, "role switched");
    Some((old, new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::context::NodeState;

    fn ctx_with(battery: f64, willingness: u8) -> Context {
        let mut state = NodeState::new([1; 6]);
        state.battery_energy_kwh = battery;
        state.battery_capacity_kwh = 100.0;
        state.willingness = willingness;
        Context::new(ProtocolConfig::default(), state)
    }

    #[test]
    fn test_rreh_is_permanent() {
        let mut ctx = ctx_with(90.0, 7);
        ctx.state.role = NodeRole::Rreh;
        assert_eq!(evaluate(&ctx, RoleInputs::default()), NodeRole::Rreh);
    }

    #[test]
    fn test_ph_criteria() {
        // 70% battery, willingness 5, no destination: no charging need.
        let ctx = ctx_with(70.0, 5);
        assert_eq!(evaluate(&ctx, RoleInputs::default()), NodeRole::PlatoonHead);
    }

    #[test]
    fn test_low_battery_blocks_ph() {
        let ctx = ctx_with(50.0, 5); // below 60%
        assert_eq!(evaluate(&ctx, RoleInputs::default()), NodeRole::Consumer);
    }

    #[test]
    fn test_low_willingness_blocks_ph() {
        let ctx = ctx_with(80.0, 3); // below threshold 4
        assert_eq!(evaluate(&ctx, RoleInputs::default()), NodeRole::Consumer);
    }

    #[test]
    fn test_active_consumer_session_blocks_ph() {
        let ctx = ctx_with(80.0, 7);
        let inputs = RoleInputs {
            consumer_session_active: true,
            ..RoleInputs::default()
        };
        assert_eq!(evaluate(&ctx, inputs), NodeRole::Consumer);
    }

    #[test]
    fn test_charging_need_wins() {
        let mut ctx = ctx_with(80.0, 7);
        // Destination far enough that shareable energy goes negative:
        // 600 km * 0.15 kWh/km = 90 kWh > 80 - 10.
        ctx.state.destination = Some((600_000.0, 0.0));
        assert_eq!(evaluate(&ctx, RoleInputs::default()), NodeRole::Consumer);
    }

    #[test]
    fn test_platoon_member_sticks() {
        let ctx = ctx_with(80.0, 7);
        let inputs = RoleInputs {
            in_platoon_as_member: true,
            ..RoleInputs::default()
        };
        assert_eq!(evaluate(&ctx, inputs), NodeRole::PlatoonMember);
    }

    #[test]
    fn test_mobile_provider_between_bars() {
        let mut ctx = ctx_with(50.0, 5); // under PH battery bar
        ctx.state.provider_capable = true;
        assert_eq!(
            evaluate(&ctx, RoleInputs::default()),
            NodeRole::MobileProvider
        );
    }

    #[test]
    fn test_tick_reports_switch_once() {
        let mut ctx = ctx_with(70.0, 5);
        let change = tick(&mut ctx, RoleInputs::default());
        assert_eq!(change, Some((NodeRole::Consumer, NodeRole::PlatoonHead)));
        assert_eq!(tick(&mut ctx, RoleInputs::default()), None);
    }
}
