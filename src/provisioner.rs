// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Provisioning
//!
//! Creates the dead-letter destination when a client is built, and declares consumed
//! destinations (with their dead-letter binding) when a consumer loop provisions.
//! Both operations are idempotent: a destination that already exists is a success.

use crate::{
    errors::BrokerError,
    transport::{Admin, DeadLetterLayout, DestinationDefinition},
};
use tracing::{debug, error};

/// Declares the dead-letter destination described by `layout`.
///
/// For exchange style brokers the exchange, the queue and the binding must all succeed.
pub async fn ensure_dead_letter(
    admin: &dyn Admin,
    layout: &DeadLetterLayout,
) -> Result<(), BrokerError> {
    match layout {
        DeadLetterLayout::Topic {
            topic,
            partitions,
            replication,
        } => {
            debug!("creating dead letter topic: {}", topic);
            declare(
                admin,
                &DestinationDefinition::topic(topic, *partitions, *replication),
            )
            .await
        }
        DeadLetterLayout::Exchange { exchange, queue } => {
            debug!("creating dead letter exchange: {} and queue: {}", exchange, queue);
            declare(admin, &DestinationDefinition::exchange(exchange)).await?;
            declare(admin, &DestinationDefinition::queue(queue, None)).await?;

            admin.bind_dead_letter(queue, exchange).await.map_err(|err| {
                error!(error = err.to_string(), "error to bind dead letter queue");
                err
            })?;

            debug!("dead letter queue: {} was bound to {}", queue, exchange);
            Ok(())
        }
    }
}

/// Declares a consumed destination with its dead-letter routing.
///
/// Topics are created with a single partition and replica when missing; queues are
/// declared with the dead-letter exchange as argument, so messages rejected without
/// requeue are routed there by the broker.
pub async fn ensure_destination(
    admin: &dyn Admin,
    layout: &DeadLetterLayout,
    destination: &str,
) -> Result<(), BrokerError> {
    let def = match layout {
        DeadLetterLayout::Topic { .. } => DestinationDefinition::topic(destination, 1, 1),
        DeadLetterLayout::Exchange { exchange, .. } => {
            DestinationDefinition::queue(destination, Some(exchange))
        }
    };

    declare(admin, &def).await
}

async fn declare(admin: &dyn Admin, def: &DestinationDefinition) -> Result<(), BrokerError> {
    match admin.declare_destination(def).await {
        Ok(()) => {
            debug!("destination: {} was created", def.name);
            Ok(())
        }
        Err(BrokerError::AlreadyExists(_)) => {
            debug!("destination: {} already exists", def.name);
            Ok(())
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the destination"
            );
            Err(err)
        }
    }
}
