use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::product_variant::{self, Entity as VariantEntity, Model as VariantModel},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Read-only catalog boundary plus the atomic stock decrement used when an
/// order is paid.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self), fields(variant_id = %variant_id))]
    pub async fn get_variant(&self, variant_id: Uuid) -> Result<VariantModel, ServiceError> {
        VariantEntity::find_by_id(variant_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product variant {} not found", variant_id))
            })
    }

    /// Batch lookup for a cart's worth of variants; one query, unordered.
    /// Missing ids are simply absent from the result, callers decide
    /// whether that is an error.
    #[instrument(skip(self, variant_ids), fields(count = variant_ids.len()))]
    pub async fn get_variants(
        &self,
        variant_ids: &[Uuid],
    ) -> Result<Vec<VariantModel>, ServiceError> {
        if variant_ids.is_empty() {
            return Ok(Vec::new());
        }

        let variants = VariantEntity::find()
            .filter(product_variant::Column::Id.is_in(variant_ids.iter().copied()))
            .all(&*self.db)
            .await?;

        Ok(variants)
    }

    /// Decrements a variant's stock, clamped at zero.
    ///
    /// Executed as a single conditional UPDATE so concurrent decrements for
    /// the same variant cannot interleave a stale read and drive the count
    /// negative.
    #[instrument(skip(self), fields(variant_id = %variant_id, quantity = quantity))]
    pub async fn decrement_stock(
        &self,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Decrement quantity must be positive".to_string(),
            ));
        }

        let result = VariantEntity::update_many()
            .col_expr(
                product_variant::Column::StockQuantity,
                Expr::cust_with_values(
                    "CASE WHEN stock_quantity >= ? THEN stock_quantity - ? ELSE 0 END",
                    [quantity, quantity],
                ),
            )
            .col_expr(
                product_variant::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(product_variant::Column::Id.eq(variant_id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            warn!(variant_id = %variant_id, "Stock decrement targeted an unknown variant");
            return Err(ServiceError::NotFound(format!(
                "Product variant {} not found",
                variant_id
            )));
        }

        let remaining = self.get_variant(variant_id).await?.stock_quantity;
        if remaining == 0 {
            info!(variant_id = %variant_id, "Variant stock depleted");
            self.event_sender
                .send(Event::StockDepleted { variant_id })
                .await;
        }

        Ok(())
    }
}
