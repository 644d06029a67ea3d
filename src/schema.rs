// Database schema definitions
diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Varchar,
        password_hash -> Varchar,
        full_name -> Nullable<Varchar>,
        organization_name -> Nullable<Varchar>,
        role_job_title -> Nullable<Varchar>,
        role -> Varchar,
        is_admin -> Nullable<Bool>,
        is_approved -> Nullable<Bool>,
        approval_status -> Varchar,
        approved_by -> Nullable<Uuid>,
        approved_at -> Nullable<Timestamptz>,
        rejection_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        last_login_at -> Nullable<Timestamptz>,
        is_first_time -> Bool,
    }
}

diesel::table! {
    settings (id) {
        id -> Int4,
        admin_id -> Nullable<Uuid>,
        notify_on_approve -> Nullable<Bool>,
        notify_on_reject -> Nullable<Bool>,
        notify_on_delete -> Nullable<Bool>,
        notify_on_registration -> Nullable<Bool>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    email_templates (id) {
        id -> Int4,
        key -> Varchar,
        subject -> Varchar,
        html_body -> Text,
        text_body -> Text,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    password_resets (id) {
        id -> Int4,
        user_id -> Uuid,
        token_hash -> Varchar,
        expires_at -> Timestamptz,
        used_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(settings -> users (admin_id));
diesel::joinable!(password_resets -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(users, settings, email_templates, password_resets,);
