//! Side effects of payment-provider events.
//!
//! Runs only for the delivery that won the event claim. Every branch is
//! safe to replay: order payment never regresses a submitted order, and
//! fulfillment dedups on the order's print idempotency key.

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use signpost_core::{Clock, OrderId, OrderType, PaymentDetails, TransitionOutcome, UserId};

use super::processor::EventHandler;
use super::subscriptions::{SubscriptionRecord, SubscriptionStore, SubscriptionUpdate};
use super::types::ProviderEvent;
use crate::checkout::CheckoutAttempts;
use crate::external::{CheckoutSession, PaymentProvider, id_field, str_field, unix_field};
use crate::fulfillment::{FulfillmentOutcome, FulfillmentService};
use crate::jobs::{JobPayload, JobQueue};
use crate::orders::OrderStore;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Clone)]
pub struct PaymentEventHandler {
    orders: Arc<dyn OrderStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    attempts: CheckoutAttempts,
    fulfillment: FulfillmentService,
    jobs: JobQueue,
    provider: Arc<dyn PaymentProvider>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PaymentEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentEventHandler").finish_non_exhaustive()
    }
}

impl PaymentEventHandler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        attempts: CheckoutAttempts,
        fulfillment: FulfillmentService,
        jobs: JobQueue,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            subscriptions,
            attempts,
            fulfillment,
            jobs,
            provider,
            clock,
        }
    }

    async fn complete_attempt(&self, session: &CheckoutSession) {
        let Some(token) = session.metadata("attempt_token") else {
            return;
        };
        match self
            .attempts
            .mark_completed(token, session.customer.as_deref())
            .await
        {
            Ok(outcome) => info!(attempt_token = token, ?outcome, "checkout attempt completed"),
            Err(err) => warn!(attempt_token = token, error = %err, "could not complete checkout attempt"),
        }
    }

    async fn subscription_checkout(&self, session: &CheckoutSession) -> anyhow::Result<()> {
        let user_id = session
            .metadata("user_id")
            .or(session.client_reference_id.as_deref())
            .and_then(|raw| raw.parse::<UserId>().ok());
        let Some(user_id) = user_id else {
            warn!(session_id = %session.id, "subscription checkout without resolvable user; skipping");
            return Ok(());
        };

        self.complete_attempt(session).await;

        let mut status = "active".to_string();
        let mut current_period_end = None;
        if let Some(sub_id) = &session.subscription {
            match self.provider.retrieve_subscription(sub_id).await {
                Ok(snapshot) => {
                    status = snapshot.status;
                    current_period_end = snapshot.current_period_end;
                }
                Err(err) => {
                    warn!(subscription_id = %sub_id, error = %err, "subscription lookup failed; assuming active")
                }
            }
        }

        info!(
            user_id = %user_id,
            customer_id = ?session.customer,
            subscription_id = ?session.subscription,
            status = %status,
            "linking subscription"
        );
        self.subscriptions
            .link_subscription(&SubscriptionRecord {
                user_id,
                customer_id: session.customer.clone(),
                subscription_id: session.subscription.clone(),
                status,
                current_period_end,
                updated_at: self.clock.now(),
            })
            .await?;
        Ok(())
    }

    /// Record payment for the session's order and start its fulfillment.
    ///
    /// Also used by reconciliation to replay a checkout whose webhook was lost.
    pub async fn apply_paid_checkout(&self, session: &CheckoutSession) -> anyhow::Result<()> {
        let order_id: OrderId = session
            .metadata("order_id")
            .or(session.client_reference_id.as_deref())
            .ok_or_else(|| anyhow!("no order_id in payment session {}", session.id))?
            .parse()
            .with_context(|| format!("invalid order_id in payment session {}", session.id))?;

        let order = self
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| anyhow!("order {order_id} not found"))?;

        if !session.is_paid() {
            warn!(
                order_id = %order_id,
                payment_status = ?session.payment_status,
                "checkout completed without payment; skipping activation"
            );
            return Ok(());
        }

        let details = PaymentDetails {
            checkout_session_id: Some(session.id.clone()),
            payment_intent_id: session.payment_intent.clone(),
            amount_total_cents: session.amount_total,
            currency: session.currency.clone(),
            shipping: session.shipping.clone(),
        };
        match self
            .orders
            .mark_order_paid(order_id, &details, self.clock.now())
            .await?
        {
            TransitionOutcome::Applied => info!(order_id = %order_id, "order marked paid"),
            TransitionOutcome::AlreadyApplied => {
                info!(order_id = %order_id, status = %order.status, "order already paid; preserving status")
            }
            TransitionOutcome::Rejected { current } => {
                warn!(order_id = %order_id, current = %current, "order not payable")
            }
            TransitionOutcome::NotFound => bail!("order {order_id} not found"),
        }

        self.complete_attempt(session).await;

        match &order.order_type {
            t if t.is_physical() => self.start_fulfillment(order_id).await,
            OrderType::ListingKit => {
                let job_id = self
                    .jobs
                    .enqueue_payload(&JobPayload::GenerateListingKit {
                        kit_id: None,
                        order_id: Some(order_id),
                    })
                    .await?;
                info!(order_id = %order_id, job_id = %job_id, "listing kit generation queued");
                Ok(())
            }
            other => {
                info!(order_id = %order_id, order_type = %other, "no physical fulfillment for order type");
                Ok(())
            }
        }
    }

    async fn start_fulfillment(&self, order_id: OrderId) -> anyhow::Result<()> {
        match self.fulfillment.fulfill_order(order_id).await {
            outcome if outcome.succeeded() => {
                info!(order_id = %order_id, ?outcome, "fulfillment complete");
                Ok(())
            }
            FulfillmentOutcome::Rejected { reason } => {
                error!(order_id = %order_id, reason = %reason, "fulfillment refused");
                Ok(())
            }
            outcome => {
                let job_id = self
                    .jobs
                    .enqueue_payload(&JobPayload::FulfillOrder { order_id })
                    .await?;
                warn!(order_id = %order_id, job_id = %job_id, ?outcome, "fulfillment failed; retry queued");
                Ok(())
            }
        }
    }

    async fn invoice_paid(&self, invoice: &Value) -> anyhow::Result<()> {
        let Some(customer_id) = id_field(invoice, "customer") else {
            return Ok(());
        };
        let subscription_id = id_field(invoice, "subscription");

        let mut current_period_end = None;
        if let Some(sub_id) = &subscription_id {
            match self.provider.retrieve_subscription(sub_id).await {
                Ok(snapshot) => current_period_end = snapshot.current_period_end,
                Err(err) => warn!(subscription_id = %sub_id, error = %err, "subscription lookup failed"),
            }
        }

        let update = SubscriptionUpdate {
            status: "active",
            current_period_end,
            now: self.clock.now(),
        };
        self.update_subscription(subscription_id.as_deref(), Some(&customer_id), false, &update)
            .await
    }

    async fn subscription_changed(&self, subscription: &Value, deleted: bool) -> anyhow::Result<()> {
        let sub_id = str_field(subscription, "id")
            .ok_or_else(|| anyhow!("subscription event without id"))?;
        let customer_id = id_field(subscription, "customer");
        let status = if deleted {
            "canceled".to_string()
        } else {
            str_field(subscription, "status").unwrap_or_else(|| "active".to_string())
        };
        let update = SubscriptionUpdate {
            status: &status,
            current_period_end: unix_field(subscription, "current_period_end"),
            now: self.clock.now(),
        };
        self.update_subscription(Some(&sub_id), customer_id.as_deref(), !deleted, &update)
            .await
    }

    /// Update by subscription id, falling back to the customer id.
    async fn update_subscription(
        &self,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
        link_on_fallback: bool,
        update: &SubscriptionUpdate<'_>,
    ) -> anyhow::Result<()> {
        if let Some(sub_id) = subscription_id {
            let touched = self
                .subscriptions
                .update_by_subscription(sub_id, update)
                .await?;
            if touched > 0 {
                info!(subscription_id = sub_id, status = update.status, "subscription updated");
                return Ok(());
            }
        }
        if let Some(customer) = customer_id {
            let link = if link_on_fallback { subscription_id } else { None };
            let touched = self
                .subscriptions
                .update_by_customer(customer, link, update)
                .await?;
            info!(customer_id = customer, touched, status = update.status, "subscription updated by customer");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PaymentEventHandler {
    async fn handle(&self, event: &ProviderEvent) -> anyhow::Result<()> {
        let object = event.object();
        match event.event_type.as_str() {
            CHECKOUT_COMPLETED => {
                let session = CheckoutSession::from_object(object)?;
                match session.mode.as_deref() {
                    Some("subscription") => self.subscription_checkout(&session).await,
                    Some("payment") => self.apply_paid_checkout(&session).await,
                    other => {
                        info!(mode = ?other, "checkout mode not handled");
                        Ok(())
                    }
                }
            }
            INVOICE_PAID => self.invoice_paid(object).await,
            SUBSCRIPTION_UPDATED => self.subscription_changed(object, false).await,
            SUBSCRIPTION_DELETED => self.subscription_changed(object, true).await,
            other => {
                info!(event_type = other, "event type ignored");
                Ok(())
            }
        }
    }
}
