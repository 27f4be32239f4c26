use crate::delivery::{Connection, Delivery};
use crate::error::ConnectError;
use crate::{connect, dane, format, ip, mx, policy};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    Format,
    PolicyFetch,
    ResolveMx,
    PolicyValidate,
    ResolveIp,
    ResolveDane,
}

/// Assemble the stage list for this delivery. Work the caller already
/// did (MX hints, attached addresses) and disabled subsystems are
/// elided; the formatter always leads and the connection engine always
/// follows.
pub(crate) fn plan_stages(delivery: &Delivery) -> Vec<Stage> {
    let mut stages = vec![Stage::Format];

    if delivery.mta_sts.enabled {
        stages.push(Stage::PolicyFetch);
    }

    let need_mx = delivery.mx.is_empty();
    if need_mx {
        stages.push(Stage::ResolveMx);
    }
    if delivery.mta_sts.enabled {
        stages.push(Stage::PolicyValidate);
    }
    if need_mx || delivery.mx.iter().any(|entry| !entry.has_addresses()) {
        stages.push(Stage::ResolveIp);
    }
    if delivery.dane.enabled {
        stages.push(Stage::ResolveDane);
    }

    stages
}

/// Run the pipeline to completion. The first failing stage aborts the
/// call with its error unchanged.
pub(crate) async fn execute(delivery: &mut Delivery) -> Result<Connection, ConnectError> {
    for stage in plan_stages(delivery) {
        match stage {
            Stage::Format => format::run(delivery)?,
            Stage::PolicyFetch => policy::fetch(delivery).await?,
            Stage::ResolveMx => mx::run(delivery).await?,
            Stage::PolicyValidate => policy::validate(delivery),
            Stage::ResolveIp => ip::run(delivery).await?,
            Stage::ResolveDane => dane::run(delivery).await?,
        }
    }
    connect::run(delivery).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::delivery::{ConnectOptions, MxHint};

    fn stages_for(options: ConnectOptions) -> Vec<Stage> {
        plan_stages(&Delivery::new(options).unwrap())
    }

    #[test]
    fn bare_target_runs_everything_needed() {
        assert_eq!(
            stages_for(ConnectOptions::new("example.com")),
            vec![Stage::Format, Stage::ResolveMx, Stage::ResolveIp]
        );
    }

    #[test]
    fn policy_and_dane_add_stages() {
        let mut options = ConnectOptions::new("example.com");
        options.mta_sts.enabled = true;
        options.dane.enabled = true;
        assert_eq!(
            stages_for(options),
            vec![
                Stage::Format,
                Stage::PolicyFetch,
                Stage::ResolveMx,
                Stage::PolicyValidate,
                Stage::ResolveIp,
                Stage::ResolveDane,
            ]
        );
    }

    #[test]
    fn hints_elide_mx_resolution() {
        let mut options = ConnectOptions::new("example.com");
        options.mx = vec![MxHint::Host("mail.example.com".to_string())];
        assert_eq!(
            stages_for(options),
            vec![Stage::Format, Stage::ResolveIp]
        );
    }

    #[test]
    fn addressed_hints_elide_ip_resolution() {
        let mut options = ConnectOptions::new("example.com");
        options.mx = vec![MxHint::Host("192.0.2.1".to_string())];
        assert_eq!(stages_for(options), vec![Stage::Format]);
    }

    #[test]
    fn mixed_hints_keep_ip_resolution() {
        let mut options = ConnectOptions::new("example.com");
        options.mx = vec![
            MxHint::Host("192.0.2.1".to_string()),
            MxHint::Host("mail.example.com".to_string()),
        ];
        assert_eq!(
            stages_for(options),
            vec![Stage::Format, Stage::ResolveIp]
        );
    }
}
