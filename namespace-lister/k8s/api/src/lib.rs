#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod labels;

pub use self::{duration::GoDuration, labels::Selector};
pub use k8s_openapi::{
    api::{
        authentication::v1::{TokenReview, TokenReviewSpec},
        core::v1::Namespace,
        rbac::v1::{
            AggregationRule, ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding,
            RoleRef, Subject,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ListMeta},
    List,
};
pub use kube::{
    api::{Api, ObjectMeta, PostParams, ResourceExt},
    runtime::watcher,
    Client,
};
