use std::sync::Arc;

use axum::http::StatusCode;
use lms::{
    domain::{
        repositories::students::StudentRepository,
        value_objects::billing::{
            AddPaymentMethodModel, DefaultPaymentMethodDto, PaymentMethodDto, PaymentMethodModel,
        },
    },
    payments::stripe_client::StripePaymentMethod,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::usecases::billing_gateway::{BillingError, BillingGateway};

type UseCaseResult<T> = std::result::Result<T, BillingError>;

fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn card_view(method: &StripePaymentMethod, is_default: bool, details: bool) -> PaymentMethodDto {
    let (brand, last4, expiry) = match &method.card {
        Some(card) => (
            title_case(&card.brand),
            card.last4.clone(),
            format!("{}/{}", card.exp_month, card.exp_year),
        ),
        None => (String::new(), String::new(), String::new()),
    };

    PaymentMethodDto {
        payment_method_id: method.id.clone(),
        brand,
        last4,
        expiry,
        is_default,
        created: details.then_some(method.created),
    }
}

fn most_recent<'a>(
    methods: &'a [StripePaymentMethod],
    excluding: Option<&str>,
) -> Option<&'a StripePaymentMethod> {
    methods
        .iter()
        .filter(|method| Some(method.id.as_str()) != excluding)
        .max_by_key(|method| method.created)
}

pub struct PaymentMethodUseCase<St, G>
where
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    student_repo: Arc<St>,
    gateway: Arc<G>,
}

impl<St, G> PaymentMethodUseCase<St, G>
where
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    pub fn new(student_repo: Arc<St>, gateway: Arc<G>) -> Self {
        Self {
            student_repo,
            gateway,
        }
    }

    /// Cards on file, default first. A customer without a default gets the most
    /// recently added card promoted.
    pub async fn list(&self, student_id: Uuid, details: bool) -> UseCaseResult<Vec<PaymentMethodDto>> {
        let customer_id = self.customer_id(student_id).await?;
        let customer = self
            .gateway
            .retrieve_customer(&customer_id)
            .await
            .map_err(BillingError::from_gateway)?;
        let mut methods = self
            .gateway
            .list_payment_methods(&customer_id)
            .await
            .map_err(BillingError::from_gateway)?;

        let mut default_id = customer.default_payment_method().map(str::to_string);
        if default_id.is_none() {
            if let Some(latest) = most_recent(&methods, None) {
                let latest_id = latest.id.clone();
                info!(
                    %student_id,
                    %customer_id,
                    payment_method_id = %latest_id,
                    "payment_methods: promoting most recent card to default"
                );
                self.make_default(&customer_id, &latest_id).await?;
                default_id = Some(latest_id);
            }
        }

        methods.sort_by(|a, b| {
            let a_default = Some(&a.id) == default_id.as_ref();
            let b_default = Some(&b.id) == default_id.as_ref();
            b_default
                .cmp(&a_default)
                .then_with(|| b.created.cmp(&a.created))
        });

        Ok(methods
            .iter()
            .map(|method| card_view(method, Some(&method.id) == default_id.as_ref(), details))
            .collect())
    }

    pub async fn add(
        &self,
        student_id: Uuid,
        add_payment_method_model: AddPaymentMethodModel,
    ) -> UseCaseResult<PaymentMethodDto> {
        let payment_method_id = add_payment_method_model.payment_method_id;
        if !payment_method_id.starts_with("pm_") {
            warn!(
                %student_id,
                status = StatusCode::BAD_REQUEST.as_u16(),
                "payment_methods: payment method id rejected"
            );
            return Err(BillingError::InvalidPaymentMethod);
        }
        let customer_id = self.customer_id(student_id).await?;

        let attached = self
            .gateway
            .attach_payment_method(&payment_method_id, &customer_id)
            .await
            .map_err(|err| {
                error!(
                    %student_id,
                    %customer_id,
                    %payment_method_id,
                    gateway_error = ?err,
                    "payment_methods: attach failed"
                );
                BillingError::from_gateway(err)
            })?;

        if add_payment_method_model.set_as_default {
            self.make_default(&customer_id, &attached.id).await?;
        }
        info!(
            %student_id,
            %payment_method_id,
            is_default = add_payment_method_model.set_as_default,
            "payment_methods: payment method attached"
        );

        Ok(card_view(&attached, add_payment_method_model.set_as_default, false))
    }

    /// Removes a card. Detaching the default promotes the most recent remaining
    /// card first; the returned value is that new default, if any.
    pub async fn detach(
        &self,
        student_id: Uuid,
        payment_method_model: PaymentMethodModel,
    ) -> UseCaseResult<Option<DefaultPaymentMethodDto>> {
        let payment_method_id = payment_method_model.payment_method_id;
        let customer_id = self.customer_id(student_id).await?;
        let methods = self
            .gateway
            .list_payment_methods(&customer_id)
            .await
            .map_err(BillingError::from_gateway)?;
        if !methods.iter().any(|method| method.id == payment_method_id) {
            return Err(BillingError::PaymentMethodNotFound);
        }

        let customer = self
            .gateway
            .retrieve_customer(&customer_id)
            .await
            .map_err(BillingError::from_gateway)?;

        let mut promoted = None;
        if customer.default_payment_method() == Some(payment_method_id.as_str()) {
            let Some(replacement) = most_recent(&methods, Some(payment_method_id.as_str())) else {
                warn!(
                    %student_id,
                    %payment_method_id,
                    status = StatusCode::BAD_REQUEST.as_u16(),
                    "payment_methods: refusing to detach the only default card"
                );
                return Err(BillingError::NoAlternativePaymentMethod);
            };
            self.make_default(&customer_id, &replacement.id).await?;
            promoted = Some(DefaultPaymentMethodDto {
                payment_method_id: replacement.id.clone(),
                last4: replacement.card.as_ref().map(|card| card.last4.clone()),
            });
        }

        self.gateway
            .detach_payment_method(&payment_method_id)
            .await
            .map_err(|err| {
                error!(
                    %student_id,
                    %payment_method_id,
                    gateway_error = ?err,
                    "payment_methods: detach failed"
                );
                BillingError::from_gateway(err)
            })?;
        info!(%student_id, %payment_method_id, "payment_methods: payment method detached");

        Ok(promoted)
    }

    pub async fn set_default(
        &self,
        student_id: Uuid,
        payment_method_model: PaymentMethodModel,
    ) -> UseCaseResult<DefaultPaymentMethodDto> {
        let payment_method_id = payment_method_model.payment_method_id;
        let customer_id = self.customer_id(student_id).await?;
        let methods = self
            .gateway
            .list_payment_methods(&customer_id)
            .await
            .map_err(BillingError::from_gateway)?;
        let Some(target) = methods.iter().find(|method| method.id == payment_method_id) else {
            return Err(BillingError::PaymentMethodNotFound);
        };

        let customer = self
            .gateway
            .retrieve_customer(&customer_id)
            .await
            .map_err(BillingError::from_gateway)?;
        if let Some(previous) = customer
            .default_payment_method()
            .filter(|previous| *previous != payment_method_id)
        {
            if let Err(err) = self.gateway.flag_payment_method_default(previous, false).await {
                warn!(
                    payment_method_id = %previous,
                    gateway_error = ?err,
                    "payment_methods: failed to clear default flag"
                );
            }
        }

        self.make_default(&customer_id, &payment_method_id).await?;
        info!(%student_id, %payment_method_id, "payment_methods: default payment method set");

        Ok(DefaultPaymentMethodDto {
            payment_method_id: target.id.clone(),
            last4: target.card.as_ref().map(|card| card.last4.clone()),
        })
    }

    async fn customer_id(&self, student_id: Uuid) -> UseCaseResult<String> {
        let student = self
            .student_repo
            .find_by_id(student_id)
            .await
            .map_err(|err| {
                error!(%student_id, db_error = ?err, "payment_methods: failed to load student");
                BillingError::Internal(err)
            })?
            .ok_or(BillingError::StudentNotFound)?;

        student.customer_id.ok_or(BillingError::MissingCustomer)
    }

    async fn make_default(&self, customer_id: &str, payment_method_id: &str) -> UseCaseResult<()> {
        self.gateway
            .set_default_payment_method(customer_id, payment_method_id)
            .await
            .map_err(BillingError::from_gateway)?;
        self.gateway
            .flag_payment_method_default(payment_method_id, true)
            .await
            .map_err(BillingError::from_gateway)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms::domain::{
        entities::students::StudentEntity, repositories::students::MockStudentRepository,
    };
    use serde_json::json;

    use crate::usecases::billing_gateway::MockBillingGateway;

    fn students() -> MockStudentRepository {
        let mut students = MockStudentRepository::new();
        students.expect_find_by_id().returning(|id| {
            Ok(Some(StudentEntity {
                id,
                email: "student@example.com".to_string(),
                first_name: "Test".to_string(),
                last_name: "Student".to_string(),
                customer_id: Some("cus_1".to_string()),
                active_episode_id: None,
                remaining_enrollment_credits: 0,
                entitlement_version: 0,
            }))
        });
        students
    }

    fn card(id: &str, created: i64, last4: &str) -> StripePaymentMethod {
        serde_json::from_value(json!({
            "id": id,
            "created": created,
            "customer": "cus_1",
            "card": { "brand": "visa", "last4": last4, "exp_month": 4, "exp_year": 2030 }
        }))
        .unwrap()
    }

    fn customer(default: Option<&str>) -> lms::payments::stripe_client::StripeCustomer {
        serde_json::from_value(json!({
            "id": "cus_1",
            "invoice_settings": { "default_payment_method": default }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn list_puts_default_first_and_formats_cards() {
        let mut gateway = MockBillingGateway::new();
        gateway
            .expect_retrieve_customer()
            .returning(|_| Ok(customer(Some("pm_old"))));
        gateway.expect_list_payment_methods().returning(|_| {
            Ok(vec![card("pm_new", 200, "4242"), card("pm_old", 100, "1881")])
        });
        gateway.expect_set_default_payment_method().times(0);

        let cards = PaymentMethodUseCase::new(Arc::new(students()), Arc::new(gateway))
            .list(Uuid::new_v4(), true)
            .await
            .unwrap();

        assert_eq!(cards[0].payment_method_id, "pm_old");
        assert!(cards[0].is_default);
        assert_eq!(cards[0].brand, "Visa");
        assert_eq!(cards[0].expiry, "4/2030");
        assert_eq!(cards[0].created, Some(100));
        assert!(!cards[1].is_default);
    }

    #[tokio::test]
    async fn list_promotes_most_recent_card_when_no_default() {
        let mut gateway = MockBillingGateway::new();
        gateway.expect_retrieve_customer().returning(|_| Ok(customer(None)));
        gateway.expect_list_payment_methods().returning(|_| {
            Ok(vec![card("pm_old", 100, "1881"), card("pm_new", 200, "4242")])
        });
        gateway
            .expect_set_default_payment_method()
            .withf(|customer, pm| customer == "cus_1" && pm == "pm_new")
            .times(1)
            .returning(|_, _| Ok(customer(Some("pm_new"))));
        gateway
            .expect_flag_payment_method_default()
            .withf(|pm, is_default| pm == "pm_new" && *is_default)
            .times(1)
            .returning(|pm, _| Ok(card(pm, 200, "4242")));

        let cards = PaymentMethodUseCase::new(Arc::new(students()), Arc::new(gateway))
            .list(Uuid::new_v4(), false)
            .await
            .unwrap();

        assert_eq!(cards[0].payment_method_id, "pm_new");
        assert!(cards[0].is_default);
        assert_eq!(cards[0].created, None);
    }

    #[tokio::test]
    async fn detaching_unknown_card_is_not_found() {
        let mut gateway = MockBillingGateway::new();
        gateway
            .expect_list_payment_methods()
            .returning(|_| Ok(vec![card("pm_a", 100, "1881")]));
        gateway.expect_detach_payment_method().times(0);

        let err = PaymentMethodUseCase::new(Arc::new(students()), Arc::new(gateway))
            .detach(
                Uuid::new_v4(),
                PaymentMethodModel {
                    payment_method_id: "pm_missing".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn detaching_only_default_card_is_refused() {
        let mut gateway = MockBillingGateway::new();
        gateway
            .expect_list_payment_methods()
            .returning(|_| Ok(vec![card("pm_a", 100, "1881")]));
        gateway
            .expect_retrieve_customer()
            .returning(|_| Ok(customer(Some("pm_a"))));
        gateway.expect_detach_payment_method().times(0);

        let err = PaymentMethodUseCase::new(Arc::new(students()), Arc::new(gateway))
            .detach(
                Uuid::new_v4(),
                PaymentMethodModel {
                    payment_method_id: "pm_a".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::NoAlternativePaymentMethod));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detaching_default_promotes_most_recent_other_card() {
        let mut gateway = MockBillingGateway::new();
        gateway.expect_list_payment_methods().returning(|_| {
            Ok(vec![
                card("pm_a", 300, "1881"),
                card("pm_b", 100, "0005"),
                card("pm_c", 200, "4242"),
            ])
        });
        gateway
            .expect_retrieve_customer()
            .returning(|_| Ok(customer(Some("pm_a"))));
        gateway
            .expect_set_default_payment_method()
            .withf(|_, pm| pm == "pm_c")
            .times(1)
            .returning(|_, _| Ok(customer(Some("pm_c"))));
        gateway
            .expect_flag_payment_method_default()
            .returning(|pm, _| Ok(card(pm, 200, "4242")));
        gateway
            .expect_detach_payment_method()
            .withf(|pm| pm == "pm_a")
            .times(1)
            .returning(|pm| Ok(card(pm, 300, "1881")));

        let promoted = PaymentMethodUseCase::new(Arc::new(students()), Arc::new(gateway))
            .detach(
                Uuid::new_v4(),
                PaymentMethodModel {
                    payment_method_id: "pm_a".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            promoted,
            Some(DefaultPaymentMethodDto {
                payment_method_id: "pm_c".to_string(),
                last4: Some("4242".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn add_rejects_ids_without_pm_prefix() {
        let mut gateway = MockBillingGateway::new();
        gateway.expect_attach_payment_method().times(0);

        let err = PaymentMethodUseCase::new(Arc::new(students()), Arc::new(gateway))
            .add(
                Uuid::new_v4(),
                AddPaymentMethodModel {
                    payment_method_id: "tok_visa".to_string(),
                    set_as_default: true,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::InvalidPaymentMethod));
    }
}
