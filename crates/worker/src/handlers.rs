use std::sync::Arc;

use hookflow::jobs::dispatcher::{
    boxed, BoxFuture, HandlerError, HandlerOptions, HandlerRegistry, JobContext, RegistryError,
};
use hookflow::webhooks::payload::{AcumaticaEvent, BigCommerceEvent, PlatformEvent, WebhookJob};
use hookflow::webhooks::platform::Platform;
use tracing::{info, warn};

/// What a webhook is about, as far as downstream sync cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Customer,
    Order,
    Product,
    Other,
}

pub fn bigcommerce_entity(scope: &str) -> Entity {
    match scope {
        "store/customer/created" | "store/customer/updated" => Entity::Customer,
        "store/order/created" | "store/order/updated" | "store/order/statusUpdated" => Entity::Order,
        "store/product/created" | "store/product/updated" | "store/product/deleted" => Entity::Product,
        _ => Entity::Other,
    }
}

pub fn acumatica_entity(entity_type: Option<&str>) -> Entity {
    match entity_type {
        Some("Customer") => Entity::Customer,
        Some("SalesOrder") => Entity::Order,
        Some("InventoryItem") => Entity::Product,
        _ => Entity::Other,
    }
}

fn handle_bigcommerce<'a>(job: &'a WebhookJob, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), HandlerError>> {
    boxed(async move {
        let event: &BigCommerceEvent = match &job.event {
            PlatformEvent::BigCommerce(e) | PlatformEvent::B2bBigCommerce(e) => e,
            other => {
                return Err(HandlerError::permanent(format!(
                    "bigcommerce handler got a {} event",
                    other.platform()
                )))
            }
        };
        let platform = job.event.platform();
        let entity = bigcommerce_entity(&event.scope);

        if entity == Entity::Other {
            warn!(record_id = %job.record_id, platform = %platform, scope = %event.scope, "unhandled scope");
        }
        info!(
            record_id = %job.record_id,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            platform = %platform,
            store_id = %event.store_id,
            scope = %event.scope,
            entity = ?entity,
            "webhook processed"
        );
        Ok(())
    })
}

fn handle_acumatica<'a>(job: &'a WebhookJob, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), HandlerError>> {
    boxed(async move {
        let PlatformEvent::Acumatica(event) = &job.event else {
            return Err(HandlerError::permanent(format!(
                "acumatica handler got a {} event",
                job.event.platform()
            )));
        };
        let AcumaticaEvent {
            event_type,
            entity_type,
            ..
        } = event;
        let entity = acumatica_entity(entity_type.as_deref());

        if entity == Entity::Other {
            warn!(record_id = %job.record_id, entity_type = ?entity_type, "unhandled entity type");
        }
        info!(
            record_id = %job.record_id,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            event_type = %event_type,
            entity = ?entity,
            "webhook processed"
        );
        Ok(())
    })
}

pub fn build_registry() -> Result<Arc<HandlerRegistry>, RegistryError> {
    let opts = || HandlerOptions::new().max_concurrency(50);

    HandlerRegistry::builder()
        .register_with_options(Platform::BigCommerce.job_type(), handle_bigcommerce, opts())
        .register_with_options(Platform::B2bBigCommerce.job_type(), handle_bigcommerce, opts())
        .register_with_options(Platform::Acumatica.job_type(), handle_acumatica, opts())
        .build()
}
