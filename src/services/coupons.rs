use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::coupon::{self, Entity as CouponEntity, Model as CouponModel},
    errors::ServiceError,
};

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds an active coupon by code (case-insensitive; codes are stored
    /// uppercase). Returns `None` for unknown, inactive or exhausted codes.
    #[instrument(skip(self))]
    pub async fn find_active(&self, code: &str) -> Result<Option<CouponModel>, ServiceError> {
        let normalized = code.trim().to_uppercase();
        if normalized.is_empty() {
            return Ok(None);
        }

        let coupon = CouponEntity::find()
            .filter(coupon::Column::Code.eq(normalized.clone()))
            .filter(coupon::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?;

        if let Some(ref coupon) = coupon {
            if let Some(max_uses) = coupon.max_uses {
                if coupon.current_uses >= max_uses {
                    warn!("Coupon {} has reached its usage limit", normalized);
                    return Ok(None);
                }
            }
        } else {
            debug!("No active coupon for code {}", normalized);
        }

        Ok(coupon)
    }

    /// Records one use of a coupon.
    ///
    /// The increment and the max-uses guard execute in a single conditional
    /// UPDATE, so a limited coupon can never be redeemed past its cap under
    /// concurrent checkouts. Uses are monotonic: refunds and cancellations
    /// do not return them.
    #[instrument(skip(self), fields(coupon_id = %coupon_id))]
    pub async fn redeem(&self, coupon_id: Uuid) -> Result<(), ServiceError> {
        let result = CouponEntity::update_many()
            .col_expr(
                coupon::Column::CurrentUses,
                Expr::col(coupon::Column::CurrentUses).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(coupon::Column::Id.eq(coupon_id))
            .filter(
                Condition::any()
                    .add(coupon::Column::MaxUses.is_null())
                    .add(
                        Expr::col(coupon::Column::CurrentUses)
                            .lt(Expr::col(coupon::Column::MaxUses)),
                    ),
            )
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Coupon {} is exhausted or does not exist",
                coupon_id
            )));
        }

        Ok(())
    }

    /// Enables the banner flag on one coupon, clearing it everywhere else
    /// first. At most one coupon carries the banner at any time.
    #[instrument(skip(self), fields(coupon_id = %coupon_id))]
    pub async fn set_banner(&self, coupon_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        CouponEntity::update_many()
            .col_expr(coupon::Column::BannerEnabled, Expr::value(false))
            .filter(coupon::Column::BannerEnabled.eq(true))
            .exec(&txn)
            .await?;

        let result = CouponEntity::update_many()
            .col_expr(coupon::Column::BannerEnabled, Expr::value(true))
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(coupon::Column::Id.eq(coupon_id))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(ServiceError::NotFound(format!(
                "Coupon {} not found",
                coupon_id
            )));
        }

        txn.commit().await?;
        Ok(())
    }
}
