//! Error classification
//!
//! Outscale reports failures as a code plus free text. The same code can mean
//! different things depending on the call that produced it: a missing route table
//! while linking is a propagation delay, while a missing volume on read means the
//! volume is gone. Classification is therefore done per [`CallSite`].

use std::sync::LazyLock;

use osc_core::provider::{ErrorClass, ProviderError};
use regex::Regex;

use crate::api::ApiError;

/// Codes such as `InvalidVolume.NotFound`, `LoadBalancerNotFound` or `NoSuchEntity`
static NOT_FOUND_CODE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(Invalid[A-Za-z]+\.NotFound|LoadBalancerNotFound|NoSuchEntity)$").ok()
});

const THROTTLING: [&str; 2] = ["RequestLimitExceeded", "Throttling"];

const MISSING_CERTIFICATE: &str = "Server Certificate not found for the key: arn";

const SUBNETS_IN_SAME_ZONE: &str = "cannot be attached to multiple subnets in the same AZ";

/// Call whose errors get a non-default reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSite {
    Default,
    /// CreateLoadBalancer: a certificate may not have propagated yet
    LoadBalancerCreate,
    /// CreateLoadBalancerListeners: the old listener or certificate may linger
    ListenerCreate,
    /// AttachLoadBalancerToSubnets: the previous subnet of the zone is still detaching
    SubnetAttach,
    /// DeleteVolume: the volume is still detaching
    VolumeDelete,
    /// DeleteSecurityGroup: something still references the group
    SecurityGroupDelete,
    /// LinkRouteTable: a fresh route table may not be visible yet
    RouteTableLink,
    /// AssociateAddress: a fresh allocation may not be visible yet
    AddressAssociate,
}

fn is_not_found(code: &str) -> bool {
    NOT_FOUND_CODE
        .as_ref()
        .map(|re| re.is_match(code))
        .unwrap_or_else(|| code.ends_with(".NotFound"))
}

/// Decide which class an API error belongs to at `site`
pub fn classify(site: CallSite, err: &ApiError) -> ErrorClass {
    let text = err.to_string();

    if THROTTLING.iter().any(|t| text.contains(t)) {
        return ErrorClass::Transient;
    }

    match site {
        CallSite::LoadBalancerCreate if text.contains("CertificateNotFound") => {
            return ErrorClass::Transient;
        }
        CallSite::ListenerCreate
            if text.contains("DuplicateListener")
                || (text.contains("CertificateNotFound") && text.contains(MISSING_CERTIFICATE)) =>
        {
            return ErrorClass::Conflict;
        }
        CallSite::SubnetAttach
            if err.code == "InvalidConfigurationRequest"
                && err.message.contains(SUBNETS_IN_SAME_ZONE) =>
        {
            return ErrorClass::Conflict;
        }
        CallSite::VolumeDelete if text.contains("VolumeInUse") => {
            return ErrorClass::Conflict;
        }
        CallSite::SecurityGroupDelete if text.contains("DependencyViolation") => {
            return ErrorClass::Conflict;
        }
        CallSite::RouteTableLink if text.contains("InvalidRouteTableID.NotFound") => {
            return ErrorClass::Transient;
        }
        CallSite::AddressAssociate
            if text.contains("InvalidAllocationID.NotFound")
                || text.contains("InvalidAddress.NotFound") =>
        {
            return ErrorClass::Transient;
        }
        _ => {}
    }

    if is_not_found(&err.code) {
        ErrorClass::NotFound
    } else {
        ErrorClass::Api
    }
}

/// Convert an API error into a classified `ProviderError`
pub fn classify_error(site: CallSite, err: ApiError) -> ProviderError {
    let class = classify(site, &err);
    ProviderError::new(class, err.to_string()).with_cause(err)
}
